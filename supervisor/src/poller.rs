//! Readiness polling over registered file descriptors.
//!
//! The reactor never blocks on a single fd; it registers every fd a
//! dispatcher reports interest in and waits on one OS readiness
//! primitive with a bounded timeout. kqueue is preferred where it
//! exists, poll(2) everywhere else.

use std::collections::BTreeSet;
use std::os::fd::RawFd;
use std::time::Duration;

use nix::libc;
use tracing::debug;

/// Outcome of one poll cycle.
///
/// `EINTR` is reported as an empty result, never as an error. Fds the
/// OS flagged as invalid are already unregistered by the poller and
/// listed in `invalid` so the caller can drop their dispatchers.
#[derive(Debug, Default)]
pub struct PollResult {
    pub readables: Vec<RawFd>,
    pub writables: Vec<RawFd>,
    pub invalid: Vec<RawFd>,
}

/// Readiness-notification facility.
pub trait FdPoller {
    fn register_readable(&mut self, fd: RawFd);
    fn register_writable(&mut self, fd: RawFd);
    fn unregister_readable(&mut self, fd: RawFd);
    fn unregister_writable(&mut self, fd: RawFd);
    fn unregister_all(&mut self);
    fn poll(&mut self, timeout: Duration) -> PollResult;
}

/// poll(2)-backed poller; available on every supported platform.
#[derive(Debug, Default)]
pub struct PollPoller {
    readables: BTreeSet<RawFd>,
    writables: BTreeSet<RawFd>,
}

impl PollPoller {
    pub fn new() -> Self {
        PollPoller::default()
    }

    const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLPRI | libc::POLLHUP;
    const WRITE_EVENTS: libc::c_short = libc::POLLOUT;
}

impl FdPoller for PollPoller {
    fn register_readable(&mut self, fd: RawFd) {
        self.readables.insert(fd);
    }

    fn register_writable(&mut self, fd: RawFd) {
        self.writables.insert(fd);
    }

    fn unregister_readable(&mut self, fd: RawFd) {
        self.readables.remove(&fd);
    }

    fn unregister_writable(&mut self, fd: RawFd) {
        self.writables.remove(&fd);
    }

    fn unregister_all(&mut self) {
        self.readables.clear();
        self.writables.clear();
    }

    fn poll(&mut self, timeout: Duration) -> PollResult {
        let mut result = PollResult::default();

        let fds: BTreeSet<RawFd> = self.readables.union(&self.writables).copied().collect();
        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|&fd| {
                let mut events = 0;
                if self.readables.contains(&fd) {
                    events |= Self::READ_EVENTS;
                }
                if self.writables.contains(&fd) {
                    events |= Self::WRITE_EVENTS;
                }
                libc::pollfd { fd, events, revents: 0 }
            })
            .collect();

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => debug!("EINTR encountered in poll"),
                Some(libc::EBADF) => {
                    debug!("EBADF encountered in poll");
                    self.unregister_all();
                }
                _ => debug!("poll error: {err}"),
            }
            return result;
        }

        for pollfd in &pollfds {
            if pollfd.revents & libc::POLLNVAL != 0 {
                // The fd is not open any more; a quit process' fds are
                // closed, so drop the registration until a restart
                // re-registers them.
                self.readables.remove(&pollfd.fd);
                self.writables.remove(&pollfd.fd);
                result.invalid.push(pollfd.fd);
                continue;
            }
            if pollfd.revents & Self::READ_EVENTS != 0 {
                result.readables.push(pollfd.fd);
            }
            if pollfd.revents & Self::WRITE_EVENTS != 0 {
                result.writables.push(pollfd.fd);
            }
        }
        result
    }
}

/// kqueue-backed poller for BSD-family systems.
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use kqueue::KqueuePoller;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue {
    use super::*;

    #[derive(Debug)]
    pub struct KqueuePoller {
        kq: RawFd,
        readables: BTreeSet<RawFd>,
        writables: BTreeSet<RawFd>,
    }

    const MAX_EVENTS: usize = 1000;

    impl KqueuePoller {
        pub fn new() -> Self {
            let kq = unsafe { libc::kqueue() };
            KqueuePoller {
                kq,
                readables: BTreeSet::new(),
                writables: BTreeSet::new(),
            }
        }

        fn control(&self, fd: RawFd, filter: i16, flags: u16) {
            let change = libc::kevent {
                ident: fd as libc::uintptr_t,
                filter,
                flags,
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            };
            let rc = unsafe {
                libc::kevent(self.kq, &change, 1, std::ptr::null_mut(), 0, std::ptr::null())
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EBADF) {
                    debug!("EBADF encountered in kqueue for fd {fd}");
                } else {
                    debug!("kevent control error for fd {fd}: {err}");
                }
            }
        }
    }

    impl Default for KqueuePoller {
        fn default() -> Self {
            KqueuePoller::new()
        }
    }

    impl Drop for KqueuePoller {
        fn drop(&mut self) {
            unsafe { libc::close(self.kq) };
        }
    }

    impl FdPoller for KqueuePoller {
        fn register_readable(&mut self, fd: RawFd) {
            if self.readables.insert(fd) {
                self.control(fd, libc::EVFILT_READ, libc::EV_ADD);
            }
        }

        fn register_writable(&mut self, fd: RawFd) {
            if self.writables.insert(fd) {
                self.control(fd, libc::EVFILT_WRITE, libc::EV_ADD);
            }
        }

        fn unregister_readable(&mut self, fd: RawFd) {
            if self.readables.remove(&fd) {
                self.control(fd, libc::EVFILT_READ, libc::EV_DELETE);
            }
        }

        fn unregister_writable(&mut self, fd: RawFd) {
            if self.writables.remove(&fd) {
                self.control(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
            }
        }

        fn unregister_all(&mut self) {
            let readables: Vec<RawFd> = self.readables.iter().copied().collect();
            for fd in readables {
                self.unregister_readable(fd);
            }
            let writables: Vec<RawFd> = self.writables.iter().copied().collect();
            for fd in writables {
                self.unregister_writable(fd);
            }
        }

        fn poll(&mut self, timeout: Duration) -> PollResult {
            let mut result = PollResult::default();
            let timespec = libc::timespec {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_nsec: timeout.subsec_nanos() as libc::c_long,
            };
            let mut events: Vec<libc::kevent> = Vec::with_capacity(MAX_EVENTS);
            let n = unsafe {
                libc::kevent(
                    self.kq,
                    std::ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    &timespec,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    debug!("EINTR encountered in poll");
                } else {
                    debug!("kevent error: {err}");
                }
                return result;
            }
            unsafe { events.set_len(n as usize) };
            for event in &events {
                if event.filter == libc::EVFILT_READ {
                    result.readables.push(event.ident as RawFd);
                }
                if event.filter == libc::EVFILT_WRITE {
                    result.writables.push(event.ident as RawFd);
                }
            }
            result
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub type DefaultPoller = KqueuePoller;

#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
pub type DefaultPoller = PollPoller;
