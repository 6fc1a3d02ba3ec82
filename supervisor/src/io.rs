//! One reactor cycle: reconcile dispatcher interest with the poller,
//! wait for readiness, service the ready dispatchers.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, error};

use crate::dispatchers::{Dispatcher, FdDispatcher};
use crate::poller::{DefaultPoller, FdPoller};

/// Upper bound on how long one cycle may block waiting for I/O, so
/// timed work (transitions, ticks) runs at least once a second.
const POLL_CEILING: Duration = Duration::from_secs(1);

pub struct IoManager<P: FdPoller = DefaultPoller> {
    poller: P,
}

impl IoManager<DefaultPoller> {
    pub fn new() -> Self {
        IoManager {
            poller: DefaultPoller::default(),
        }
    }
}

impl Default for IoManager<DefaultPoller> {
    fn default() -> Self {
        IoManager::new()
    }
}

impl<P: FdPoller> IoManager<P> {
    pub fn with_poller(poller: P) -> Self {
        IoManager { poller }
    }

    /// Block up to `timeout` (capped at one second) and service every
    /// dispatcher that became ready. A dispatcher error closes that
    /// dispatcher only; the cycle goes on.
    pub fn run_cycle(&mut self, dispatchers: &mut HashMap<RawFd, &mut Dispatcher>, timeout: Duration) {
        for (&fd, dispatcher) in dispatchers.iter() {
            if dispatcher.readable() {
                self.poller.register_readable(fd);
            } else {
                self.poller.unregister_readable(fd);
            }
            if dispatcher.writable() {
                self.poller.register_writable(fd);
            } else {
                self.poller.unregister_writable(fd);
            }
        }

        let result = self.poller.poll(timeout.min(POLL_CEILING));

        for fd in result.invalid {
            if let Some(dispatcher) = dispatchers.get_mut(&fd) {
                debug!("fd {fd} went invalid, closing its dispatcher");
                dispatcher.close();
            }
        }

        for fd in result.readables {
            match dispatchers.get_mut(&fd) {
                Some(dispatcher) => {
                    if let Err(err) = dispatcher.on_readable() {
                        error!("read error on {} fd {fd}: {err}", dispatcher.channel());
                        dispatcher.close();
                        self.poller.unregister_readable(fd);
                    }
                }
                None => {
                    // A process was reaped between registration and
                    // readiness; its fd no longer has an owner.
                    debug!("unexpected read event from fd {fd}");
                    self.poller.unregister_readable(fd);
                    self.poller.unregister_writable(fd);
                }
            }
        }

        for fd in result.writables {
            match dispatchers.get_mut(&fd) {
                Some(dispatcher) => {
                    if let Err(err) = dispatcher.on_writable() {
                        error!("write error on {} fd {fd}: {err}", dispatcher.channel());
                        dispatcher.close();
                        self.poller.unregister_writable(fd);
                    }
                }
                None => {
                    debug!("unexpected write event from fd {fd}");
                    self.poller.unregister_readable(fd);
                    self.poller.unregister_writable(fd);
                }
            }
        }
    }

    /// Drop every registration, for shutdown.
    pub fn clear(&mut self) {
        self.poller.unregister_all();
    }
}
