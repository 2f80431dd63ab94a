//! Command/response framing protocol.
//!
//! Commands are relayed to the remote shell as plain text. Each wire
//! command carries a trailer instruction that makes the remote shell
//! print two sentinel bytes (ETX, EOT) once the operator's command has
//! finished, so the local end can tell where a response stops.
//!
//! A response is complete when the contiguous 3-byte sequence
//! `{ETX, EOT, ' '}` (control bytes in either order) arrives. Earlier
//! versions of this protocol tracked the two control bytes as sticky
//! independent flags, which falsely terminated on any later space byte
//! once both sentinels had appeared anywhere in the stream; the
//! contiguous match here deliberately corrects that.

use bytes::BytesMut;

/// ETX, printed by the remote trailer after the command's output.
pub const END_OF_TEXT: u8 = 0x03;

/// EOT, printed by the remote trailer after the command's output.
pub const END_OF_TRANSMISSION: u8 = 0x04;

/// Separator between the operator's command and the trailer.
pub const CMD_SEPARATOR: &[u8] = b" ; ";

/// Maximum assembled wire command length in bytes.
pub const MAX_COMMAND_LEN: usize = 1024;

/// The operator line that ends the session after being relayed.
pub const EXIT_CMD: &[u8] = b"exit\n";

/// Shell instruction the remote end runs to emit the sentinels.
/// The two control bytes are embedded literally in the printf argument.
const SENTINEL_TRAILER: &[u8] = b"printf \"\x03\x04\"\n";

/// Command assembly errors.
#[derive(Debug, PartialEq, Eq)]
pub enum AssembleError {
    /// The assembled wire command would exceed [`MAX_COMMAND_LEN`].
    TooLong { len: usize, max: usize },
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssembleError::TooLong { len, max } => {
                write!(f, "command too long: {} bytes assembled, max {}", len, max)
            }
        }
    }
}

impl std::error::Error for AssembleError {}

/// Assemble one operator line into the bytes sent to the remote shell.
///
/// A line of just a newline ("press enter") becomes the trailer alone.
/// Any other line becomes the line's text, the separator, then the
/// trailer. A missing trailing newline (stdin closed mid-line) is
/// treated the same as a newline-terminated line.
pub fn assemble_command(raw_line: &[u8]) -> Result<BytesMut, AssembleError> {
    let body = raw_line.strip_suffix(b"\n").unwrap_or(raw_line);

    if body.is_empty() {
        return Ok(BytesMut::from(SENTINEL_TRAILER));
    }

    let wire_len = body.len() + CMD_SEPARATOR.len() + SENTINEL_TRAILER.len();
    if wire_len > MAX_COMMAND_LEN {
        return Err(AssembleError::TooLong {
            len: wire_len,
            max: MAX_COMMAND_LEN,
        });
    }

    let mut wire = BytesMut::with_capacity(wire_len);
    wire.extend_from_slice(body);
    wire.extend_from_slice(CMD_SEPARATOR);
    wire.extend_from_slice(SENTINEL_TRAILER);
    Ok(wire)
}

/// What to do with a byte pushed into the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStep {
    /// Forward the byte to the operator's terminal.
    Forward(u8),
    /// A sentinel control byte; never forwarded.
    Swallowed,
    /// The terminator space. Forward it, then stop reading: the
    /// response is complete. Bytes after it must stay unread.
    Complete,
}

/// Incremental detector for the end-of-response terminator.
///
/// Tracks the last two bytes received; a space arriving right after
/// both sentinels (in either order) completes the scan.
#[derive(Debug)]
pub struct ResponseScanner {
    window: [u8; 2],
}

impl ResponseScanner {
    pub fn new() -> Self {
        Self { window: [0; 2] }
    }

    /// Consume one byte from the response stream.
    pub fn push(&mut self, byte: u8) -> ScanStep {
        if byte == b' ' && self.window_holds_sentinels() {
            return ScanStep::Complete;
        }

        let step = match byte {
            END_OF_TEXT | END_OF_TRANSMISSION => ScanStep::Swallowed,
            other => ScanStep::Forward(other),
        };

        self.window = [self.window[1], byte];
        step
    }

    fn window_holds_sentinels(&self) -> bool {
        matches!(
            self.window,
            [END_OF_TEXT, END_OF_TRANSMISSION] | [END_OF_TRANSMISSION, END_OF_TEXT]
        )
    }
}

impl Default for ResponseScanner {
    fn default() -> Self {
        Self::new()
    }
}
