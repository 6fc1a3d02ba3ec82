//! Supervisor-specific error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while trying to start a child process.
///
/// All of these are recoverable from the supervisor's point of view:
/// the owning process records the message and transitions to BACKOFF
/// rather than letting the error propagate to the main loop.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("can't parse command {command:?}: {reason}")]
    BadCommand { command: String, reason: String },

    #[error("can't find command {command:?}")]
    NotFound { command: String },

    #[error("command at {path:?} is not executable")]
    NotExecutable { path: PathBuf },

    #[error("no permission to run command {path:?}")]
    NoPermission { path: PathBuf },

    #[error("too many open files to spawn {name:?}")]
    TooManyOpenFiles { name: String },

    #[error("too many processes in process table to spawn {name:?}")]
    ProcessTableFull { name: String },

    #[error("unknown error spawning {name:?}: {errno}")]
    Os { name: String, errno: nix::errno::Errno },
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("duplicate process name {name:?} in group {group:?}")]
    DuplicateProcess { group: String, name: String },

    #[error("duplicate process group {name:?}")]
    DuplicateGroup { name: String },

    #[error("invalid configuration: {field} = {value}")]
    InvalidConfig { field: String, value: String },

    #[error("invalid user {user:?}")]
    InvalidUser { user: String },

    #[error("could not drop privileges: {reason}")]
    Privileges { reason: String },

    #[error(
        "minimum {name} of {min} could not be set, hard limit is {hard}; \
         raise the limit in your environment or lower the configured minimum"
    )]
    Rlimit { name: &'static str, min: u64, hard: u64 },

    #[error("failed to install signal handler for {signal}: {errno}")]
    SignalSetup { signal: &'static str, errno: nix::errno::Errno },

    #[error("could not daemonize: {errno}")]
    Daemonize { errno: nix::errno::Errno },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
