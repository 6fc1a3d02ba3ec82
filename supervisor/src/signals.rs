//! Async-signal-safe signal latch.
//!
//! The handler only flips an atomic flag; the main loop drains one
//! pending signal per iteration so every signal gets a full reactor
//! cycle of processing before the next is looked at.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{SupervisorError, SupervisorResult};

/// Signals the supervisor reacts to, in the order they are drained.
/// Shutdown requests outrank everything else.
const HANDLED_SIGNALS: &[Signal] = &[
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGHUP,
    Signal::SIGCHLD,
    Signal::SIGUSR2,
];

const MAX_SIGNO: usize = 64;

static PENDING: [AtomicBool; MAX_SIGNO] = {
    const FLAG: AtomicBool = AtomicBool::new(false);
    [FLAG; MAX_SIGNO]
};

extern "C" fn latch(signo: i32) {
    if let Some(flag) = PENDING.get(signo as usize) {
        flag.store(true, Ordering::Relaxed);
    }
}

/// Installs the handlers and hands pending signals to the main loop.
#[derive(Debug, Default)]
pub struct SignalReceiver {
    installed: bool,
}

impl SignalReceiver {
    pub fn new() -> Self {
        SignalReceiver::default()
    }

    /// Install the latch for every handled signal.
    pub fn install(&mut self) -> SupervisorResult<()> {
        let action = SigAction::new(SigHandler::Handler(latch), SaFlags::empty(), SigSet::empty());
        for &sig in HANDLED_SIGNALS {
            unsafe { signal::sigaction(sig, &action) }.map_err(|errno| {
                SupervisorError::SignalSetup {
                    signal: sig.as_str(),
                    errno,
                }
            })?;
        }
        self.installed = true;
        Ok(())
    }

    /// Restore default dispositions; used before re-exec on restart.
    pub fn uninstall(&mut self) {
        if !self.installed {
            return;
        }
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for &sig in HANDLED_SIGNALS {
            let _ = unsafe { signal::sigaction(sig, &action) };
        }
        self.installed = false;
    }

    /// Take one pending signal, if any.
    pub fn get_signal(&mut self) -> Option<Signal> {
        for &sig in HANDLED_SIGNALS {
            if PENDING[sig as usize].swap(false, Ordering::Relaxed) {
                return Some(sig);
            }
        }
        None
    }
}

impl Drop for SignalReceiver {
    fn drop(&mut self) {
        self.uninstall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Signal dispositions are process-global, so everything runs in
    // one test to avoid harness-thread interleaving.
    #[test]
    fn test_latch_and_drain_order() {
        let mut receiver = SignalReceiver::new();
        receiver.install().unwrap();
        assert!(receiver.get_signal().is_none());

        signal::raise(Signal::SIGUSR2).unwrap();
        signal::raise(Signal::SIGHUP).unwrap();

        // One per call, shutdown-priority first.
        assert_eq!(receiver.get_signal(), Some(Signal::SIGHUP));
        assert_eq!(receiver.get_signal(), Some(Signal::SIGUSR2));
        assert!(receiver.get_signal().is_none());

        // Raised again after draining, latched again.
        signal::raise(Signal::SIGUSR2).unwrap();
        assert_eq!(receiver.get_signal(), Some(Signal::SIGUSR2));

        receiver.uninstall();
    }
}
