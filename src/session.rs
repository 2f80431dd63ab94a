//! Session loop for one connected peer.
//!
//! Drives the prompt drain, then a read-command/transmit/await-response
//! cycle until the operator sends `exit`, the peer disconnects, or the
//! shutdown flag is raised. One session owns its connection exclusively
//! for its whole lifetime; the acceptor closes it afterwards.

use std::io::{self, BufRead, Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::protocol::{self, ResponseScanner, ScanStep};
use crate::shutdown::ShutdownFlag;

/// Upper bound on any single readiness wait, so the shutdown flag is
/// observed with at most this much latency.
pub const POLL_TICK: Duration = Duration::from_millis(250);

/// A connected remote endpoint.
///
/// Reads and writes are non-blocking; `wait_readable` is the bounded
/// readiness wait every network-facing block goes through.
pub trait Peer: Read + Write {
    /// Wait until the peer has bytes to read, up to `timeout`.
    /// Returns `false` if the wait elapsed with nothing ready.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;
}

/// Session timing knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to drain the remote shell's startup banner/prompt.
    pub prompt_timeout: Duration,
    /// How long to wait for a command's full output.
    pub reply_timeout: Duration,
}

/// How a response drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Terminator seen; anything after it stays unread in the stream.
    Complete,
    /// Deadline hit (or a non-fatal read error); not an error, the
    /// session simply moves on.
    TimedOut,
    /// Shutdown flag was raised.
    Aborted,
    /// Peer closed the connection.
    Disconnected,
}

/// Session Loop states, one connection from prompt to termination.
enum SessionState {
    AwaitingPrompt,
    ReadingCommand,
    Dispatching(Vec<u8>),
    AwaitingResponse,
    Terminating,
}

/// Run one session to completion.
///
/// `input` is the operator's line source (stdin in production),
/// `output` receives the peer's forwarded response bytes.
pub fn run_session<P: Peer, R: BufRead, W: Write>(
    peer: &mut P,
    input: &mut R,
    output: &mut W,
    config: &SessionConfig,
    shutdown: ShutdownFlag,
) -> io::Result<()> {
    let mut state = SessionState::AwaitingPrompt;

    loop {
        state = match state {
            SessionState::AwaitingPrompt => {
                match drain_response(peer, config.prompt_timeout, shutdown, output)? {
                    ScanOutcome::Aborted | ScanOutcome::Disconnected => SessionState::Terminating,
                    ScanOutcome::Complete | ScanOutcome::TimedOut => SessionState::ReadingCommand,
                }
            }
            SessionState::ReadingCommand => match read_command(input, shutdown) {
                Some(line) => SessionState::Dispatching(line),
                None => SessionState::Terminating,
            },
            SessionState::Dispatching(line) => dispatch(peer, &line),
            SessionState::AwaitingResponse => {
                match drain_response(peer, config.reply_timeout, shutdown, output)? {
                    ScanOutcome::Aborted | ScanOutcome::Disconnected => SessionState::Terminating,
                    // Timeout and success both resume the command loop.
                    ScanOutcome::Complete | ScanOutcome::TimedOut => SessionState::ReadingCommand,
                }
            }
            SessionState::Terminating => return Ok(()),
        };
    }
}

/// Read one operator line. `None` means the session should end:
/// input exhausted, input error, or shutdown raised.
fn read_command<R: BufRead>(input: &mut R, shutdown: ShutdownFlag) -> Option<Vec<u8>> {
    if shutdown.is_set() {
        return None;
    }

    let mut line = Vec::new();
    match input.read_until(b'\n', &mut line) {
        Ok(0) => None,
        Ok(_) => {
            if shutdown.is_set() {
                return None;
            }
            // A final line cut off by EOF still gets its terminator.
            if !line.ends_with(b"\n") {
                line.push(b'\n');
            }
            Some(line)
        }
        Err(e) => {
            warn!(error = %e, "Failed to read operator input");
            None
        }
    }
}

/// Assemble and transmit one command, deciding the next state.
fn dispatch<P: Peer>(peer: &mut P, line: &[u8]) -> SessionState {
    let wire = match protocol::assemble_command(line) {
        Ok(wire) => wire,
        Err(e) => {
            // Rejected before anything hits the wire.
            warn!(error = %e, "Rejecting command");
            return SessionState::ReadingCommand;
        }
    };

    debug!(bytes = wire.len(), "Relaying command");
    if let Err(e) = peer.write_all(&wire) {
        warn!(error = %e, "Failed to send command");
        return SessionState::Terminating;
    }

    if line == protocol::EXIT_CMD {
        // Relayed so the remote shell exits too; no response expected.
        SessionState::Terminating
    } else {
        SessionState::AwaitingResponse
    }
}

/// Scan one response off the peer, forwarding its bytes to `sink` as
/// they arrive.
///
/// The wait is sliced into [`POLL_TICK`] intervals, and the shutdown
/// flag and `timeout` deadline are also checked on every byte while
/// draining, so neither a silent peer nor a flooding one can delay
/// cancellation. Errors returned are sink failures only; peer-side
/// errors are logged and folded into the outcome.
pub fn drain_response<P: Peer, W: Write>(
    peer: &mut P,
    timeout: Duration,
    shutdown: ShutdownFlag,
    sink: &mut W,
) -> io::Result<ScanOutcome> {
    let mut scanner = ResponseScanner::new();
    let deadline = Instant::now() + timeout;

    loop {
        // Drain whatever is already buffered before waiting, so bytes
        // left over from a previous scan are picked up even without a
        // fresh readiness event. The shutdown flag and deadline are
        // checked per byte inside the drain.
        if let Some(outcome) = drain_ready(peer, &mut scanner, sink, shutdown, deadline)? {
            return Ok(outcome);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(ScanOutcome::TimedOut);
        }

        match peer.wait_readable(POLL_TICK.min(deadline - now)) {
            // Ready or tick elapsed; the loop re-checks either way.
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Readiness wait on peer failed");
                return Ok(ScanOutcome::TimedOut);
            }
        }
    }
}

/// Feed ready bytes into the scanner one at a time until the stream
/// would block. Forwarded bytes go out immediately, flushed per burst,
/// so the operator sees output as it arrives.
fn drain_ready<P: Peer, W: Write>(
    peer: &mut P,
    scanner: &mut ResponseScanner,
    sink: &mut W,
    shutdown: ShutdownFlag,
    deadline: Instant,
) -> io::Result<Option<ScanOutcome>> {
    let mut forwarded = false;

    let outcome = loop {
        // Checked per byte: a peer that keeps data flowing must not
        // pin the loop past an abort or the scan deadline.
        if shutdown.is_set() {
            break Some(ScanOutcome::Aborted);
        }
        if Instant::now() >= deadline {
            break Some(ScanOutcome::TimedOut);
        }

        let mut byte = [0u8; 1];
        match peer.read(&mut byte) {
            Ok(0) => break Some(ScanOutcome::Disconnected),
            Ok(_) => match scanner.push(byte[0]) {
                ScanStep::Forward(b) => {
                    sink.write_all(&[b])?;
                    forwarded = true;
                }
                ScanStep::Swallowed => {}
                ScanStep::Complete => {
                    sink.write_all(&[byte[0]])?;
                    forwarded = true;
                    break Some(ScanOutcome::Complete);
                }
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break None,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Read from peer failed");
                break Some(ScanOutcome::TimedOut);
            }
        }
    };

    if forwarded {
        sink.flush()?;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;

    /// In-memory peer with scripted responses.
    ///
    /// `current` holds bytes readable right now; further chunks in
    /// `pending` become readable only after a command is written,
    /// mimicking a shell that only produces output when driven.
    struct MockPeer {
        current: VecDeque<u8>,
        pending: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        eof: bool,
        reads: usize,
    }

    impl MockPeer {
        fn new(prompt: &[u8], replies: &[&[u8]]) -> Self {
            Self {
                current: prompt.iter().copied().collect(),
                pending: replies.iter().map(|r| r.to_vec()).collect(),
                written: Vec::new(),
                eof: false,
                reads: 0,
            }
        }

        fn silent() -> Self {
            Self::new(b"", &[])
        }
    }

    impl Read for MockPeer {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            match self.current.pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                }
                None if self.eof => Ok(0),
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no data")),
            }
        }
    }

    impl Write for MockPeer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            // A command was transmitted; release the next reply.
            if let Some(chunk) = self.pending.pop_front() {
                self.current.extend(chunk);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Peer for MockPeer {
        fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
            Ok(!self.current.is_empty() || self.eof)
        }
    }

    /// Peer with an endless supply of data, optionally raising the
    /// shutdown flag from inside its first read.
    struct FloodingPeer {
        abort_on_first_read: Option<ShutdownFlag>,
        reads: usize,
    }

    impl Read for FloodingPeer {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            if self.reads == 1 {
                if let Some(flag) = self.abort_on_first_read {
                    flag.set();
                }
            }
            buf[0] = b'x';
            Ok(1)
        }
    }

    impl Write for FloodingPeer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Peer for FloodingPeer {
        fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
            Ok(true)
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            prompt_timeout: Duration::from_millis(10),
            reply_timeout: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_drain_times_out_on_silent_peer() {
        let mut peer = MockPeer::silent();
        let mut out = Vec::new();
        let outcome = drain_response(
            &mut peer,
            Duration::from_millis(10),
            ShutdownFlag::manual(),
            &mut out,
        )
        .unwrap();
        assert_eq!(outcome, ScanOutcome::TimedOut);
        assert!(out.is_empty());
    }

    #[test]
    fn test_drain_aborts_without_reading_when_flag_preset() {
        let mut peer = MockPeer::new(b"data", &[]);
        let shutdown = ShutdownFlag::manual();
        shutdown.set();

        let mut out = Vec::new();
        let outcome =
            drain_response(&mut peer, Duration::from_secs(120), shutdown, &mut out).unwrap();
        assert_eq!(outcome, ScanOutcome::Aborted);
        assert_eq!(peer.reads, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_drain_aborts_mid_burst() {
        let flag = ShutdownFlag::manual();
        let mut peer = FloodingPeer {
            abort_on_first_read: Some(flag),
            reads: 0,
        };
        let mut out = Vec::new();

        let outcome =
            drain_response(&mut peer, Duration::from_secs(120), flag, &mut out).unwrap();

        assert_eq!(outcome, ScanOutcome::Aborted);
        // The flag was raised during the first read; at most that one
        // byte may slip through before the drain stops.
        assert!(
            out.len() <= 1,
            "drain kept reading after the flag was raised: {} bytes",
            out.len()
        );
    }

    #[test]
    fn test_drain_deadline_holds_mid_burst() {
        let mut peer = FloodingPeer {
            abort_on_first_read: None,
            reads: 0,
        };
        let mut out = Vec::new();

        // The peer never blocks, so only the per-byte deadline check
        // can end this drain.
        let outcome = drain_response(
            &mut peer,
            Duration::from_millis(5),
            ShutdownFlag::manual(),
            &mut out,
        )
        .unwrap();

        assert_eq!(outcome, ScanOutcome::TimedOut);
    }

    #[test]
    fn test_drain_stops_at_terminator_leaving_rest_unread() {
        let mut peer = MockPeer::new(b"hello\x03\x04 world", &[]);
        let mut out = Vec::new();
        let outcome = drain_response(
            &mut peer,
            Duration::from_secs(1),
            ShutdownFlag::manual(),
            &mut out,
        )
        .unwrap();
        assert_eq!(outcome, ScanOutcome::Complete);
        assert_eq!(out, b"hello ");
        assert_eq!(peer.current, b"world".iter().copied().collect::<VecDeque<_>>());
    }

    #[test]
    fn test_drain_reports_disconnect() {
        let mut peer = MockPeer::new(b"partial", &[]);
        peer.eof = true;
        let mut out = Vec::new();
        let outcome = drain_response(
            &mut peer,
            Duration::from_secs(1),
            ShutdownFlag::manual(),
            &mut out,
        )
        .unwrap();
        assert_eq!(outcome, ScanOutcome::Disconnected);
        assert_eq!(out, b"partial");
    }

    #[test]
    fn test_session_relays_command_and_echoes_response() {
        let mut peer = MockPeer::new(b"$ ", &[&b"file1\nfile2\n\x03\x04 "[..]]);
        let mut input = Cursor::new(&b"ls\n"[..]);
        let mut output = Vec::new();

        run_session(
            &mut peer,
            &mut input,
            &mut output,
            &test_config(),
            ShutdownFlag::manual(),
        )
        .unwrap();

        assert_eq!(peer.written, b"ls ; printf \"\x03\x04\"\n");
        assert_eq!(output, b"$ file1\nfile2\n ");
    }

    #[test]
    fn test_session_empty_line_sends_trailer_only() {
        let mut peer = MockPeer::silent();
        let mut input = Cursor::new(&b"\n"[..]);
        let mut output = Vec::new();

        run_session(
            &mut peer,
            &mut input,
            &mut output,
            &test_config(),
            ShutdownFlag::manual(),
        )
        .unwrap();

        assert_eq!(peer.written, b"printf \"\x03\x04\"\n");
    }

    #[test]
    fn test_session_exit_transmits_then_terminates_without_response() {
        let reply: &[u8] = b"never read\x03\x04 ";
        let mut peer = MockPeer::new(b"", &[reply]);
        let mut input = Cursor::new(&b"exit\nls\n"[..]);
        let mut output = Vec::new();

        run_session(
            &mut peer,
            &mut input,
            &mut output,
            &test_config(),
            ShutdownFlag::manual(),
        )
        .unwrap();

        // exit relayed, but the follow-up line never dispatched and the
        // released reply never drained.
        assert_eq!(peer.written, b"exit ; printf \"\x03\x04\"\n");
        assert_eq!(peer.current.len(), reply.len());
        assert!(output.is_empty());
    }

    #[test]
    fn test_session_rejects_too_long_line_without_transmitting() {
        let mut peer = MockPeer::silent();
        let mut line = vec![b'a'; 2048];
        line.push(b'\n');
        let mut input = Cursor::new(line);
        let mut output = Vec::new();

        run_session(
            &mut peer,
            &mut input,
            &mut output,
            &test_config(),
            ShutdownFlag::manual(),
        )
        .unwrap();

        assert!(peer.written.is_empty());
    }

    #[test]
    fn test_session_returns_promptly_when_flag_preset() {
        let mut peer = MockPeer::new(b"$ ", &[]);
        let shutdown = ShutdownFlag::manual();
        shutdown.set();

        let mut input = Cursor::new(&b"ls\n"[..]);
        let mut output = Vec::new();

        run_session(&mut peer, &mut input, &mut output, &test_config(), shutdown).unwrap();

        assert_eq!(peer.reads, 0);
        assert!(peer.written.is_empty());
        assert!(output.is_empty());
    }
}
