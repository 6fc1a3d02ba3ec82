//! Stdin/stdout/stderr pipe pairs for one child process.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};

/// Pipe pairs wiring a child's standard streams to the supervisor.
///
/// The parent ends (`stdin` is the write end, `stdout`/`stderr` read
/// ends) are opened non-blocking so the reactor can service them
/// without stalling. Child ends are closed in the parent immediately
/// after fork; parent ends are dropped when the process is reaped.
#[derive(Debug, Default)]
pub struct ProcessPipes {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
    pub child_stdin: Option<OwnedFd>,
    pub child_stdout: Option<OwnedFd>,
    pub child_stderr: Option<OwnedFd>,
}

impl ProcessPipes {
    /// Create the pipe pairs; no stderr pipe when the child's stderr
    /// is redirected onto stdout.
    pub fn new(use_stderr: bool) -> Result<Self, Errno> {
        let mut pipes = ProcessPipes::default();

        let (read_end, write_end) = nix::unistd::pipe()?;
        pipes.child_stdin = Some(read_end);
        pipes.stdin = Some(write_end);

        let (read_end, write_end) = nix::unistd::pipe()?;
        pipes.stdout = Some(read_end);
        pipes.child_stdout = Some(write_end);

        if use_stderr {
            let (read_end, write_end) = nix::unistd::pipe()?;
            pipes.stderr = Some(read_end);
            pipes.child_stderr = Some(write_end);
        }

        for fd in [&pipes.stdin, &pipes.stdout, &pipes.stderr].into_iter().flatten() {
            set_nonblocking(fd.as_raw_fd())?;
        }
        Ok(pipes)
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn stderr_fd(&self) -> Option<RawFd> {
        self.stderr.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn child_stdin_fd(&self) -> Option<RawFd> {
        self.child_stdin.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn child_stdout_fd(&self) -> Option<RawFd> {
        self.child_stdout.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn child_stderr_fd(&self) -> Option<RawFd> {
        self.child_stderr.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Drop the child-side ends; called in the parent after fork.
    pub fn close_child_ends(&mut self) {
        self.child_stdin.take();
        self.child_stdout.take();
        self.child_stderr.take();
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}
