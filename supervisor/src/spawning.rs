//! fork/exec machinery for starting one child process.
//!
//! Everything that can fail is checked or allocated before the fork;
//! the child half runs only async-signal-safe calls plus `execve`, and
//! reports exec failure by writing to its stderr pipe and exiting 127.

use std::ffi::{CString, OsString};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::errno::Errno;
use nix::libc;
use nix::sys::stat::Mode;
use nix::unistd::{self, ForkResult, Pid, Uid};
use tracing::info;

use crate::config::{ProcessConfig, ServerConfig};
use crate::dispatchers::{Dispatcher, DispatcherMap, InputDispatcher, OutputDispatcher};
use crate::error::SpawnError;
use crate::events::{Channel, EventBus};
use crate::pipes::ProcessPipes;
use crate::users;

/// Exit code a child reports when it could not exec its command.
const EXEC_FAILURE_EXIT: i32 = 127;

/// A successfully forked child and the parent-side plumbing for it.
#[derive(Debug)]
pub struct Spawned {
    pub pid: Pid,
    pub pipes: ProcessPipes,
    pub dispatchers: DispatcherMap,
}

/// Split a command line and resolve its executable.
///
/// A bare program name is searched on `$PATH`; a name containing a
/// slash is used as given. The resolved path is checked for existence
/// and execute permission so most spawn failures are caught before
/// forking.
pub fn resolve_command(command: &str) -> Result<(PathBuf, Vec<String>), SpawnError> {
    let args = shell_words::split(command).map_err(|err| SpawnError::BadCommand {
        command: command.to_string(),
        reason: err.to_string(),
    })?;
    let program = args.first().ok_or_else(|| SpawnError::BadCommand {
        command: command.to_string(),
        reason: "command is empty".to_string(),
    })?;

    let path = if program.contains('/') {
        PathBuf::from(program)
    } else {
        search_path(program).ok_or_else(|| SpawnError::NotFound {
            command: program.clone(),
        })?
    };
    check_executable(&path, program)?;
    Ok((path, args))
}

fn search_path(program: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_else(|| OsString::from("/bin:/usr/bin"));
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn check_executable(path: &Path, program: &str) -> Result<(), SpawnError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => {
            return Err(SpawnError::NotFound {
                command: program.to_string(),
            })
        }
    };
    if metadata.is_dir() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(SpawnError::NotExecutable {
            path: path.to_path_buf(),
        });
    }
    if unistd::access(path, unistd::AccessFlags::X_OK).is_err() {
        return Err(SpawnError::NoPermission {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Environment for the child: the supervisor's own environment plus
/// the standard supervision variables plus configured overrides.
fn build_environment(name: &str, group: &str, config: &ProcessConfig, server: &ServerConfig) -> Vec<CString> {
    let mut env: Vec<(String, String)> = std::env::vars().collect();
    let mut set = |key: &str, value: &str| {
        env.retain(|(k, _)| k != key);
        env.push((key.to_string(), value.to_string()));
    };
    set("SUPERVISOR_ENABLED", "1");
    set("SUPERVISOR_SERVER_IDENTIFIER", &server.identifier);
    set("SUPERVISOR_PROCESS_NAME", name);
    set("SUPERVISOR_GROUP_NAME", group);
    if let Some(overrides) = &config.environment {
        for (key, value) in overrides {
            set(key, value);
        }
    }
    env.into_iter()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect()
}

fn dispatchers_for(
    name: &str,
    group: &str,
    pid: Pid,
    config: &ProcessConfig,
    server: &ServerConfig,
    pipes: &ProcessPipes,
    bus: &EventBus,
) -> DispatcherMap {
    let mut map = DispatcherMap::new();
    if let Some(fd) = pipes.stdout_fd() {
        map.insert(
            fd,
            Dispatcher::Output(OutputDispatcher::new(
                name,
                group,
                pid.as_raw(),
                Channel::Stdout,
                fd,
                &config.stdout,
                server.strip_ansi,
                bus.clone(),
            )),
        );
    }
    if let Some(fd) = pipes.stderr_fd() {
        map.insert(
            fd,
            Dispatcher::Output(OutputDispatcher::new(
                name,
                group,
                pid.as_raw(),
                Channel::Stderr,
                fd,
                &config.stderr,
                server.strip_ansi,
                bus.clone(),
            )),
        );
    }
    if let Some(fd) = pipes.stdin_fd() {
        map.insert(fd, Dispatcher::Input(InputDispatcher::new(name, fd)));
    }
    map
}

/// Fork and exec one child, returning its pid and pipe dispatchers.
pub fn spawn_process(
    name: &str,
    group: &str,
    config: &ProcessConfig,
    server: &Rc<ServerConfig>,
    bus: &EventBus,
) -> Result<Spawned, SpawnError> {
    let (path, args) = resolve_command(&config.command)?;

    let mut pipes = ProcessPipes::new(!config.redirect_stderr).map_err(|errno| match errno {
        Errno::EMFILE | Errno::ENFILE => SpawnError::TooManyOpenFiles {
            name: name.to_string(),
        },
        errno => SpawnError::Os {
            name: name.to_string(),
            errno,
        },
    })?;

    // Everything the child needs must be allocated before the fork.
    let program = CString::new(path.as_os_str().as_bytes()).map_err(|_| SpawnError::BadCommand {
        command: config.command.clone(),
        reason: "path contains a NUL byte".to_string(),
    })?;
    let argv: Vec<CString> = args
        .iter()
        .filter_map(|arg| CString::new(arg.as_str()).ok())
        .collect();
    let envp = build_environment(name, group, config, server);
    let directory = config
        .directory
        .as_ref()
        .and_then(|dir| CString::new(dir.as_os_str().as_bytes()).ok());
    let uid = config.uid.map(Uid::from_raw);
    let umask = config.umask;
    let min_fds = server.min_fds;
    let redirect_stderr = config.redirect_stderr;

    let child_stdin = pipes.child_stdin_fd();
    let child_stdout = pipes.child_stdout_fd();
    let child_stderr = pipes.child_stderr_fd();

    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { child }) => {
            pipes.close_child_ends();
            let dispatchers = dispatchers_for(name, group, child, config, server, &pipes, bus);
            info!("spawned: {:?} with pid {child}", name);
            Ok(Spawned {
                pid: child,
                pipes,
                dispatchers,
            })
        }
        Ok(ForkResult::Child) => {
            exec_child(
                &program,
                &argv,
                &envp,
                child_stdin,
                child_stdout,
                child_stderr,
                redirect_stderr,
                directory.as_deref(),
                uid,
                umask,
                min_fds,
            );
        }
        Err(Errno::EAGAIN) => Err(SpawnError::ProcessTableFull {
            name: name.to_string(),
        }),
        Err(errno) => Err(SpawnError::Os {
            name: name.to_string(),
            errno,
        }),
    }
}

/// Child-side half of the fork; never returns.
#[allow(clippy::too_many_arguments)]
fn exec_child(
    program: &CString,
    argv: &[CString],
    envp: &[CString],
    child_stdin: Option<RawFd>,
    child_stdout: Option<RawFd>,
    child_stderr: Option<RawFd>,
    redirect_stderr: bool,
    directory: Option<&std::ffi::CStr>,
    uid: Option<Uid>,
    umask: Option<u32>,
    min_fds: u64,
) -> ! {
    // The child is placed in its own process group so stop_as_group
    // and kill_as_group can signal the whole tree.
    let _ = unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));

    unsafe {
        if let Some(fd) = child_stdin {
            libc::dup2(fd, 0);
        }
        if let Some(fd) = child_stdout {
            libc::dup2(fd, 1);
            if redirect_stderr {
                libc::dup2(fd, 2);
            }
        }
        if let Some(fd) = child_stderr {
            libc::dup2(fd, 2);
        }
        for fd in 3..min_fds as RawFd {
            libc::close(fd);
        }
    }

    if let Some(uid) = uid {
        if let Some(reason) = users::drop_privileges(uid) {
            child_fail(&format!("couldn't setuid to {uid}: {reason}"));
        }
    }
    if let Some(dir) = directory {
        if unistd::chdir(dir).is_err() {
            child_fail(&format!("couldn't chdir to {}", dir.to_string_lossy()));
        }
    }
    if let Some(umask) = umask {
        nix::sys::stat::umask(Mode::from_bits_truncate(umask as libc::mode_t));
    }

    let err = unistd::execve(program, argv, envp).unwrap_err();
    child_fail(&format!(
        "couldn't exec {}: {err}",
        program.to_string_lossy()
    ));
}

/// Report a post-fork failure on the (already duped) stderr and exit.
fn child_fail(msg: &str) -> ! {
    let line = format!("supervisor: {msg}\n");
    unsafe {
        libc::write(2, line.as_ptr() as *const libc::c_void, line.len());
        libc::_exit(EXEC_FAILURE_EXIT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_command_splits_arguments() {
        let (path, args) = resolve_command("/bin/sh -c 'echo hi'").unwrap();
        assert_eq!(path, PathBuf::from("/bin/sh"));
        assert_eq!(args, vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_resolve_command_searches_path() {
        let (path, _) = resolve_command("sh -c true").unwrap();
        assert!(path.ends_with("sh"));
        assert!(path.is_absolute());
    }

    #[test]
    fn test_resolve_missing_command() {
        match resolve_command("/no/such/program --flag") {
            Err(SpawnError::NotFound { command }) => assert_eq!(command, "/no/such/program"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_resolve_rejects_directory() {
        match resolve_command("/tmp") {
            Err(SpawnError::NotExecutable { path }) => assert_eq!(path, PathBuf::from("/tmp")),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_resolve_rejects_empty_command() {
        assert!(matches!(
            resolve_command(""),
            Err(SpawnError::BadCommand { .. })
        ));
    }

    #[test]
    fn test_resolve_rejects_unbalanced_quotes() {
        assert!(matches!(
            resolve_command("sh -c 'unterminated"),
            Err(SpawnError::BadCommand { .. })
        ));
    }

    #[test]
    fn test_spawn_real_child_and_reap_it() {
        let server = Rc::new(ServerConfig {
            min_fds: 64,
            ..ServerConfig::default()
        });
        let config = ProcessConfig::new("echoer", "/bin/sh -c 'echo out'");
        let bus = EventBus::new();

        let spawned = spawn_process("echoer", "default", &config, &server, &bus).unwrap();
        assert!(spawned.pid.as_raw() > 0);
        assert_eq!(spawned.dispatchers.len(), 3);

        let mut status: libc::c_int = 0;
        let reaped = unsafe { libc::waitpid(spawned.pid.as_raw(), &mut status, 0) };
        assert_eq!(reaped, spawned.pid.as_raw());
        assert_eq!(crate::fds::decode_wait_status(status).0, 0);
    }

    #[test]
    fn test_environment_carries_process_identity() {
        let server = Rc::new(ServerConfig::default());
        let mut config = ProcessConfig::new("worker", "true");
        config.environment =
            Some([("EXTRA".to_string(), "1".to_string())].into_iter().collect());

        let env = build_environment("worker_0", "workers", &config, &server);
        let entries: Vec<String> = env
            .iter()
            .map(|entry| entry.to_string_lossy().into_owned())
            .collect();
        assert!(entries.contains(&"SUPERVISOR_ENABLED=1".to_string()));
        assert!(entries.contains(&"SUPERVISOR_PROCESS_NAME=worker_0".to_string()));
        assert!(entries.contains(&"SUPERVISOR_GROUP_NAME=workers".to_string()));
        assert!(entries.contains(&"EXTRA=1".to_string()));
    }
}
