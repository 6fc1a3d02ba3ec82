//! Low-level file descriptor and wait-status helpers.

use std::io;
use std::os::fd::RawFd;

use nix::libc;
use nix::sys::signal::Signal;

/// Largest chunk read from a child pipe in one readiness event.
const READ_CHUNK: usize = 2 << 16;

/// Read whatever is available from a non-blocking fd.
///
/// Returns an empty buffer on `EWOULDBLOCK`/`EBADF`/`EINTR`; callers
/// treat an empty read after a readiness notification as child EOF.
pub fn read_fd(fd: RawFd) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; READ_CHUNK];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) | Some(libc::EBADF) | Some(libc::EINTR) => Ok(Vec::new()),
            _ => Err(err),
        };
    }
    buf.truncate(n as usize);
    Ok(buf)
}

/// Single non-blocking write; returns the number of bytes accepted.
///
/// `EAGAIN` reports zero bytes written; `EPIPE` and everything else
/// surface as errors so the caller can tear the channel down.
pub fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(0),
            _ => Err(err),
        };
    }
    Ok(n as usize)
}

/// Human-readable name for a raw signal number.
pub fn signame(sig: i32) -> String {
    match Signal::try_from(sig) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => format!("signal {sig}"),
    }
}

/// Decode a raw status from `wait()`/`waitpid()`.
///
/// Returns `(exit_code, message)` where `exit_code` is `-1` if the
/// process was killed by a signal. The caller decides whether and how
/// to display the message.
pub fn decode_wait_status(sts: i32) -> (i32, String) {
    if libc::WIFEXITED(sts) {
        let code = libc::WEXITSTATUS(sts);
        (code, format!("exit status {code}"))
    } else if libc::WIFSIGNALED(sts) {
        let sig = libc::WTERMSIG(sts);
        let mut msg = format!("terminated by {}", signame(sig));
        if libc::WCOREDUMP(sts) {
            msg.push_str(" (core dumped)");
        }
        (-1, msg)
    } else {
        (-1, format!("unknown termination cause {sts:#06x}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::process::Command;

    // Raw wait statuses as the kernel encodes them.
    fn exited(code: i32) -> i32 {
        (code & 0xff) << 8
    }

    fn signaled(sig: i32) -> i32 {
        sig & 0x7f
    }

    #[test]
    fn test_decode_exit_status() {
        assert_eq!(decode_wait_status(exited(0)), (0, "exit status 0".to_string()));
        assert_eq!(decode_wait_status(exited(3)), (3, "exit status 3".to_string()));
        assert_eq!(decode_wait_status(exited(127)), (127, "exit status 127".to_string()));
    }

    #[test]
    fn test_decode_signal_termination() {
        let (code, msg) = decode_wait_status(signaled(libc::SIGKILL));
        assert_eq!(code, -1);
        assert_eq!(msg, "terminated by SIGKILL");

        let (code, msg) = decode_wait_status(signaled(libc::SIGTERM));
        assert_eq!(code, -1);
        assert_eq!(msg, "terminated by SIGTERM");
    }

    #[test]
    fn test_decode_core_dump() {
        let (code, msg) = decode_wait_status(signaled(libc::SIGSEGV) | 0x80);
        assert_eq!(code, -1);
        assert_eq!(msg, "terminated by SIGSEGV (core dumped)");
    }

    #[test]
    fn test_decode_real_child_status() {
        use std::os::unix::process::ExitStatusExt;

        let status = Command::new("sh").arg("-c").arg("exit 7").status().unwrap();
        let (code, msg) = decode_wait_status(status.into_raw());
        assert_eq!(code, 7);
        assert_eq!(msg, "exit status 7");
    }

    #[test]
    fn test_signame() {
        assert_eq!(signame(libc::SIGTERM), "SIGTERM");
        assert_eq!(signame(libc::SIGKILL), "SIGKILL");
        assert_eq!(signame(9999), "signal 9999");
    }

    #[test]
    fn test_read_fd_round_trip() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        use std::os::fd::AsRawFd;

        let mut f = std::fs::File::from(write_end);
        f.write_all(b"hello").unwrap();
        drop(f);

        let data = read_fd(read_end.as_raw_fd()).unwrap();
        assert_eq!(data, b"hello");

        // Writer closed: next read reports EOF as an empty buffer.
        let data = read_fd(read_end.as_raw_fd()).unwrap();
        assert!(data.is_empty());
    }
}
