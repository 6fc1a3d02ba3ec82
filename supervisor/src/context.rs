//! Server-wide runtime context: identity, limits, pidfile, daemon
//! setup and child reaping.

use std::fs::File;
use std::os::fd::RawFd;
use std::path::Path;
use std::rc::Rc;

use nix::errno::Errno;
use nix::libc;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::stat::Mode;
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::process::PidHistory;
use crate::signals::SignalReceiver;
use crate::states::SupervisorState;
use crate::users;

/// First fd closed by [`ServerContext::cleanup_fds`]; lower fds are
/// the std streams plus the logger's file.
const FIRST_DISPOSABLE_FD: RawFd = 5;

pub struct ServerContext {
    config: Rc<ServerConfig>,
    pub state: SupervisorState,
    pub pid_history: PidHistory,
    pub signals: SignalReceiver,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Self {
        ServerContext {
            config: Rc::new(config),
            state: SupervisorState::Restarting,
            pid_history: PidHistory::new(),
            signals: SignalReceiver::new(),
        }
    }

    pub fn config(&self) -> &Rc<ServerConfig> {
        &self.config
    }

    /// Drop privileges to the configured user, if any.
    pub fn set_uid(&self) -> SupervisorResult<()> {
        let Some(user) = &self.config.user else {
            if unistd::getuid().is_root() {
                warn!(
                    "supervisor is running as root; privileges were not dropped because \
                     no user is specified in the config file"
                );
            }
            return Ok(());
        };
        let uid = users::name_to_uid(user)?;
        if let Some(reason) = users::drop_privileges(uid) {
            return Err(SupervisorError::Privileges { reason });
        }
        info!("set uid to user {uid}");
        Ok(())
    }

    /// Raise soft resource limits to the configured minimums.
    pub fn set_rlimits(&self) -> SupervisorResult<()> {
        raise_rlimit(Resource::RLIMIT_NOFILE, "file descriptors", self.config.min_fds)?;
        raise_rlimit(Resource::RLIMIT_NPROC, "processes", self.config.min_procs)?;
        Ok(())
    }

    /// Close inherited fds the supervisor has no business holding.
    pub fn cleanup_fds(&self) {
        for fd in FIRST_DISPOSABLE_FD..self.config.min_fds as RawFd {
            unsafe { libc::close(fd) };
        }
    }

    pub fn write_pidfile(&self) -> SupervisorResult<()> {
        let pid = std::process::id();
        std::fs::write(&self.config.pidfile, format!("{pid}\n"))?;
        info!("supervisord started with pid {pid}");
        Ok(())
    }

    pub fn unlink_pidfile(&self) {
        if let Err(err) = std::fs::remove_file(&self.config.pidfile) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "could not remove pidfile {}: {err}",
                    self.config.pidfile.display()
                );
            }
        }
    }

    /// Detach from the controlling terminal and run in the background.
    pub fn daemonize(&self) -> SupervisorResult<()> {
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { .. }) => {
                // The parent's only job was the fork.
                unsafe { libc::_exit(0) };
            }
            Ok(ForkResult::Child) => {}
            Err(errno) => return Err(SupervisorError::Daemonize { errno }),
        }

        let dir = self
            .config
            .directory
            .clone()
            .unwrap_or_else(|| Path::new("/").to_path_buf());
        unistd::chdir(&dir).map_err(|errno| SupervisorError::Daemonize { errno })?;
        unistd::setsid().map_err(|errno| SupervisorError::Daemonize { errno })?;
        nix::sys::stat::umask(Mode::from_bits_truncate(self.config.umask as libc::mode_t));

        // Detach the std streams.
        let devnull = File::options()
            .read(true)
            .write(true)
            .open("/dev/null")?;
        use std::os::fd::AsRawFd;
        for fd in 0..=2 {
            unsafe { libc::dup2(devnull.as_raw_fd(), fd) };
        }
        Ok(())
    }

    /// Reap one exited child, if any.
    ///
    /// Returns the pid and raw wait status; `None` when no child is
    /// waiting. `ECHILD` means there are no children at all and is not
    /// an error.
    pub fn reap_one(&mut self) -> Option<(Pid, i32)> {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid == 0 {
            return None;
        }
        if pid < 0 {
            match Errno::last() {
                Errno::ECHILD => debug!("no child processes to reap"),
                Errno::EINTR => debug!("EINTR during reap"),
                errno => warn!("waitpid error: {errno}"),
            }
            return None;
        }
        Some((Pid::from_raw(pid), status))
    }
}

fn raise_rlimit(resource: Resource, name: &'static str, min: u64) -> SupervisorResult<()> {
    const INFINITY: u64 = libc::RLIM_INFINITY as u64;

    let (soft, hard) = getrlimit(resource).map_err(errno_to_error)?;
    if soft == INFINITY || soft >= min {
        return Ok(());
    }
    if hard == INFINITY || hard >= min {
        setrlimit(resource, min, hard).map_err(errno_to_error)?;
        info!("raised soft limit for {name} to {min}");
        return Ok(());
    }
    Err(SupervisorError::Rlimit { name, min, hard })
}

fn errno_to_error(errno: Errno) -> SupervisorError {
    SupervisorError::Io(std::io::Error::from_raw_os_error(errno as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rlimit_already_sufficient() {
        let context = ServerContext::new(ServerConfig {
            min_fds: 8,
            min_procs: 8,
            ..ServerConfig::default()
        });
        context.set_rlimits().unwrap();
    }

    #[test]
    fn test_rlimit_beyond_hard_limit_fails() {
        let (_, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        if hard == libc::RLIM_INFINITY as u64 {
            return;
        }
        let result = raise_rlimit(Resource::RLIMIT_NOFILE, "file descriptors", hard + 1);
        assert!(matches!(result, Err(SupervisorError::Rlimit { .. })));
    }

    #[test]
    fn test_pidfile_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let context = ServerContext::new(ServerConfig {
            pidfile: dir.path().join("supervisord.pid"),
            ..ServerConfig::default()
        });

        context.write_pidfile().unwrap();
        let contents = std::fs::read_to_string(dir.path().join("supervisord.pid")).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());

        context.unlink_pidfile();
        assert!(!dir.path().join("supervisord.pid").exists());
        // Unlinking twice is quiet.
        context.unlink_pidfile();
    }
}
