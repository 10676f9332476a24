//! # Cancellation Watcher Module
//!
//! Cooperative cancellation for the driver loop. An operator interrupt
//! (SIGINT/SIGTERM/SIGHUP) must not interrupt the loop at an arbitrary
//! point; the signal handler only marks a flag, and the driver polls that
//! flag exactly once per iteration at the top of the loop. On a marked flag
//! the driver runs the same finishing actions as normal completion.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

// Set from the signal handler. A store into a static atomic is the only
// thing the handler does, which keeps it async-signal-safe.
static SIGNAL_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigend(_signal: libc::c_int) {
    SIGNAL_FLAG.store(true, Ordering::SeqCst);
}

/// Shared cancellation flag polled by the driver.
///
/// Clones observe the same flag. [`CancelToken::install_signal_handler`]
/// additionally arms the process-wide termination signals; tokens that were
/// never armed (library embedders, tests) only react to [`CancelToken::cancel`].
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the termination-signal handler (SIGINT, SIGTERM, SIGHUP).
    ///
    /// The handler only sets a flag; it runs no other code in signal
    /// context. Any previously latched signal is discarded so a fresh run
    /// starts clean.
    pub fn install_signal_handler(&mut self) -> io::Result<()> {
        SIGNAL_FLAG.store(false, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(handle_sigend),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // Safety: the handler is a plain flag store and registration
            // happens before the driver loop starts.
            unsafe { signal::sigaction(sig, &action) }.map_err(io::Error::from)?;
        }

        self.armed = true;
        debug!("termination signal handler installed");
        Ok(())
    }

    /// Request cancellation programmatically.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested, by token or by signal.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.armed && SIGNAL_FLAG.load(Ordering::SeqCst))
    }
}
