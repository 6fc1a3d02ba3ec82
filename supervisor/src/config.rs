//! Plain configuration structs consumed by the supervision engine.
//!
//! Parsing and validating these from a config file format is a
//! collaborator's job; the engine only ever sees the structs below.
//! The field defaults mirror supervisord's.

use std::collections::HashMap;
use std::path::PathBuf;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

/// Server-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// User to drop privileges to at startup, if running as root.
    pub user: Option<String>,
    /// Stay in the foreground instead of daemonizing.
    pub nodaemon: bool,
    /// Umask applied to the supervisor process when daemonizing.
    pub umask: u32,
    /// Directory to chdir into when daemonizing.
    pub directory: Option<PathBuf>,
    /// Where to write the supervisor's own pid.
    pub pidfile: PathBuf,
    /// Identifier included in child log names and status reports.
    pub identifier: String,
    /// Minimum number of file descriptors the supervisor needs.
    pub min_fds: u64,
    /// Minimum number of processes the supervisor needs.
    pub min_procs: u64,
    /// Strip ANSI escape sequences from captured child output.
    pub strip_ansi: bool,
    /// Process groups to supervise.
    pub groups: Vec<ProcessGroupConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            user: None,
            nodaemon: false,
            umask: 0o22,
            directory: None,
            pidfile: PathBuf::from("supervisord.pid"),
            identifier: "supervisor".to_string(),
            min_fds: 1024,
            min_procs: 200,
            strip_ansi: false,
            groups: Vec::new(),
        }
    }
}

/// A named, priority-ordered collection of process configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessGroupConfig {
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub processes: Vec<ProcessConfig>,
}

/// Restart policy applied when a process exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutoRestart {
    /// Never restart automatically.
    Never,
    /// Restart only when the exit code is not in `exitcodes`.
    #[default]
    Unexpected,
    /// Restart regardless of exit code.
    Always,
}

/// Per-channel child log settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    /// Log file the channel output is appended to, if any.
    pub file: Option<PathBuf>,
    /// Emit a process log event for every chunk of output.
    pub events_enabled: bool,
    /// Scan the stream for communication-event begin/end tokens.
    pub capture_events: bool,
}

/// Configuration of a single supervised program.
///
/// One `ProcessConfig` materializes `num_procs` process instances at
/// group construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub name: String,
    pub command: String,

    /// Number of process instances to create (`name_<i>` when > 1).
    pub num_procs: u32,
    /// Uid to run the child as; requires the supervisor to be root.
    pub uid: Option<u32>,
    /// Working directory for the child.
    pub directory: Option<PathBuf>,
    /// Umask applied in the child before exec.
    pub umask: Option<u32>,
    /// Start/stop ordering within the group; lower starts first.
    pub priority: i32,

    /// Start the process when the supervisor starts.
    pub auto_start: bool,
    pub auto_restart: AutoRestart,

    /// Seconds the process must stay up to be considered RUNNING.
    pub start_secs: u64,
    /// Start attempts before giving up and entering FATAL.
    pub start_retries: u32,

    /// Signal sent on stop (raw signal number; default SIGTERM).
    pub stop_signal: i32,
    /// Seconds to wait after `stop_signal` before escalating to SIGKILL.
    pub stop_wait_secs: u64,
    /// Send the stop signal to the child's whole OS process group.
    pub stop_as_group: bool,
    /// Send the SIGKILL escalation to the whole OS process group.
    pub kill_as_group: bool,

    /// Exit codes considered an expected termination.
    pub exitcodes: Vec<i32>,

    /// Merge the child's stderr onto its stdout pipe.
    pub redirect_stderr: bool,

    /// Extra environment variables layered onto the supervisor's own.
    pub environment: Option<HashMap<String, String>>,

    pub stdout: LogConfig,
    pub stderr: LogConfig,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            name: String::new(),
            command: String::new(),
            num_procs: 1,
            uid: None,
            directory: None,
            umask: None,
            priority: default_priority(),
            auto_start: true,
            auto_restart: AutoRestart::Unexpected,
            start_secs: 1,
            start_retries: 3,
            stop_signal: Signal::SIGTERM as i32,
            stop_wait_secs: 10,
            stop_as_group: false,
            kill_as_group: false,
            exitcodes: vec![0],
            redirect_stderr: false,
            environment: None,
            stdout: LogConfig::default(),
            stderr: LogConfig::default(),
        }
    }
}

impl ProcessConfig {
    /// Minimal configuration for a command, everything else defaulted.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        ProcessConfig {
            name: name.into(),
            command: command.into(),
            ..ProcessConfig::default()
        }
    }

    /// The configured stop signal, falling back to SIGTERM if the raw
    /// number does not name a signal on this platform.
    pub fn stop_signal(&self) -> Signal {
        Signal::try_from(self.stop_signal).unwrap_or(Signal::SIGTERM)
    }
}

fn default_priority() -> i32 {
    999
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_config_defaults() {
        let config = ProcessConfig::new("web", "/usr/bin/web --serve");
        assert_eq!(config.num_procs, 1);
        assert_eq!(config.start_secs, 1);
        assert_eq!(config.start_retries, 3);
        assert_eq!(config.stop_signal(), Signal::SIGTERM);
        assert_eq!(config.stop_wait_secs, 10);
        assert_eq!(config.exitcodes, vec![0]);
        assert!(config.auto_start);
        assert_eq!(config.auto_restart, AutoRestart::Unexpected);
    }

    #[test]
    fn test_bad_stop_signal_falls_back_to_term() {
        let config = ProcessConfig {
            stop_signal: 12345,
            ..ProcessConfig::new("x", "x")
        };
        assert_eq!(config.stop_signal(), Signal::SIGTERM);
    }

    #[test]
    fn test_server_config_json_round_trip() {
        let config = ServerConfig {
            groups: vec![ProcessGroupConfig {
                name: "default".to_string(),
                priority: 999,
                processes: vec![ProcessConfig::new("sleep", "sleep 600")],
            }],
            ..ServerConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_auto_restart_parses_lowercase() {
        let policy: AutoRestart = serde_json::from_str("\"unexpected\"").unwrap();
        assert_eq!(policy, AutoRestart::Unexpected);
        let policy: AutoRestart = serde_json::from_str("\"always\"").unwrap();
        assert_eq!(policy, AutoRestart::Always);
    }
}
