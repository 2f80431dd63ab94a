//! TCP acceptor for the relay.
//!
//! Owns the listening socket and serves exactly one session at a time:
//! accept, run the session loop to completion, close, wait for the
//! next peer. The accept wait is a mio poll bounded by the shutdown
//! poll tick, so a termination signal ends the server promptly even
//! while idle.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::session::{self, Peer, SessionConfig, POLL_TICK};
use crate::shutdown::ShutdownFlag;

const LISTENER_TOKEN: Token = Token(0);
const PEER_TOKEN: Token = Token(1);

/// How long a blocked write to the peer may wait for writability
/// before the send is given up. Commands are at most 1 KiB, so this
/// only trips on a wedged connection.
const WRITE_WAIT: Duration = Duration::from_secs(5);

/// Server instance: one listener, sessions served sequentially.
pub struct Server {
    config: Config,
    shutdown: ShutdownFlag,
}

impl Server {
    pub fn new(config: Config, shutdown: ShutdownFlag) -> Self {
        Server { config, shutdown }
    }

    /// Bind, listen, and serve sessions until the shutdown flag is set.
    ///
    /// Socket/bind/listen failures are fatal and propagate to `main`.
    pub fn run(&self) -> io::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = create_listener(addr)?;
        let mut listener = TcpListener::from_std(listener);

        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(4);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(addr = %addr, "Server listening");

        let session_config = SessionConfig {
            prompt_timeout: self.config.prompt_timeout,
            reply_timeout: self.config.reply_timeout,
        };

        while !self.shutdown.is_set() {
            match poll.poll(&mut events, Some(POLL_TICK)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if self.shutdown.is_set() {
                break;
            }
            if events.is_empty() {
                continue;
            }

            drain_accept(&listener, self.shutdown, |stream, peer_addr| {
                info!(peer = %peer_addr, "Client connected");
                self.serve(stream, &session_config);
                info!(peer = %peer_addr, "Client disconnected");
            });
        }

        info!("Exiting");
        Ok(())
    }

    /// Run one session over an accepted stream. Session errors end the
    /// session, never the server.
    fn serve(&self, stream: TcpStream, session_config: &SessionConfig) {
        let mut peer = match MioPeer::new(stream) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(error = %e, "Failed to set up client connection");
                return;
            }
        };

        let stdin = io::stdin();
        let stdout = io::stdout();
        if let Err(e) = session::run_session(
            &mut peer,
            &mut stdin.lock(),
            &mut stdout.lock(),
            session_config,
            self.shutdown,
        ) {
            warn!(error = %e, "Session ended with error");
        }
        // Dropping the peer closes the connection.
    }
}

/// Accept every connection currently queued, serving each one to
/// completion before taking the next.
///
/// The poll registration is edge-triggered, so a wake for several
/// queued peers arrives as one event; stopping after a single accept
/// would strand the rest until a fresh connection produced a new
/// edge. Draining until `WouldBlock` closes that gap.
fn drain_accept<F>(listener: &TcpListener, shutdown: ShutdownFlag, mut serve: F)
where
    F: FnMut(TcpStream, SocketAddr),
{
    while !shutdown.is_set() {
        match listener.accept() {
            Ok((stream, peer_addr)) => serve(stream, peer_addr),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Accept failed");
                break;
            }
        }
    }
}

/// Create the listening socket: all interfaces, backlog of 1 since
/// sessions are strictly sequential.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;

    Ok(socket.into())
}

/// A connected client stream with its own poll registration, giving
/// the session loop a bounded readiness wait over a non-blocking
/// socket.
pub struct MioPeer {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    interest: Interest,
}

impl MioPeer {
    pub fn new(mut stream: TcpStream) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, PEER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            stream,
            poll,
            events: Events::with_capacity(4),
            interest: Interest::READABLE,
        })
    }

    fn wait_for(&mut self, interest: Interest, timeout: Duration) -> io::Result<bool> {
        if self.interest != interest {
            self.poll
                .registry()
                .reregister(&mut self.stream, PEER_TOKEN, interest)?;
            self.interest = interest;
        }

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(!self.events.is_empty()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Read for MioPeer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for MioPeer {
    /// Write, waiting for writability on `WouldBlock` so the short
    /// wire commands always go out whole.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.stream.write(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !self.wait_for(Interest::WRITABLE, WRITE_WAIT)? {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "peer not writable",
                        ));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Peer for MioPeer {
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        self.wait_for(Interest::READABLE, timeout)
    }
}
