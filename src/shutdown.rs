//! Cooperative shutdown flag.
//!
//! Termination signals set a process-wide atomic exactly once; every
//! blocking wait in the server checks it before and after waiting, so
//! the process winds down within one poll tick of a signal. The flag
//! is monotonic and never cleared.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

static SIGNALLED: AtomicBool = AtomicBool::new(false);

/// Cancellation token handed to every blocking component.
///
/// Copyable so it can be passed by value through the accept loop,
/// session loop, and response drain without shared-state plumbing.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownFlag(&'static AtomicBool);

impl ShutdownFlag {
    /// Register SIGINT, SIGTERM, and SIGQUIT handlers and return the
    /// flag they set. SIGKILL cannot be caught, so it is not listed.
    pub fn install() -> io::Result<Self> {
        for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGQUIT] {
            register(sig)?;
        }
        Ok(Self(&SIGNALLED))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// A flag isolated from the signal handlers, for tests.
    #[cfg(test)]
    pub fn manual() -> Self {
        Self(Box::leak(Box::new(AtomicBool::new(false))))
    }

    #[cfg(test)]
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

extern "C" fn on_signal(_sig: libc::c_int) {
    // Only async-signal-safe work here: a single atomic store.
    SIGNALLED.store(true, Ordering::Relaxed);
}

fn register(sig: libc::c_int) -> io::Result<()> {
    let handler = on_signal as extern "C" fn(libc::c_int);

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
