//! Serializable snapshots of the supervision tree.

use serde::Serialize;

use crate::process::Process;
use crate::states::{ProcessState, SupervisorState};
use crate::supervisor::Supervisor;

#[derive(Debug, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    pub group: String,
    pub state: ProcessState,
    pub pid: Option<i32>,
    pub exit_status: Option<i32>,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct SupervisorStatus {
    pub identifier: String,
    pub state: SupervisorState,
    pub processes: Vec<ProcessStatus>,
}

/// Point-in-time view of every process under supervision.
pub fn snapshot(supervisor: &Supervisor) -> SupervisorStatus {
    let processes = supervisor
        .groups()
        .groups()
        .iter()
        .flat_map(|group| group.processes())
        .map(process_status)
        .collect();
    SupervisorStatus {
        identifier: supervisor.identifier().to_string(),
        state: supervisor.state(),
        processes,
    }
}

fn process_status(process: &Process) -> ProcessStatus {
    ProcessStatus {
        name: process.name().to_string(),
        group: process.group_name().to_string(),
        state: process.state(),
        pid: process.pid().map(|pid| pid.as_raw()),
        exit_status: process.exit_status(),
        description: describe(process),
    }
}

fn describe(process: &Process) -> String {
    match process.state() {
        ProcessState::Running | ProcessState::Starting | ProcessState::Stopping => process
            .pid()
            .map(|pid| format!("pid {pid}"))
            .unwrap_or_default(),
        ProcessState::Backoff | ProcessState::Fatal => {
            process.spawn_err().unwrap_or_default().to_string()
        }
        ProcessState::Exited => process
            .exit_status()
            .map(|es| format!("exit status {es}"))
            .unwrap_or_default(),
        ProcessState::Stopped | ProcessState::Unknown => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessConfig, ProcessGroupConfig, ServerConfig};

    #[test]
    fn test_snapshot_serializes_stopped_process() {
        let config = ServerConfig {
            identifier: "test-supervisor".to_string(),
            groups: vec![ProcessGroupConfig {
                name: "default".to_string(),
                priority: 999,
                processes: vec![ProcessConfig {
                    auto_start: false,
                    ..ProcessConfig::new("idle", "sleep 60")
                }],
            }],
            ..ServerConfig::default()
        };
        let supervisor = Supervisor::new(config).unwrap();

        let status = snapshot(&supervisor);
        assert_eq!(status.identifier, "test-supervisor");
        assert_eq!(status.processes.len(), 1);
        assert_eq!(status.processes[0].state, ProcessState::Stopped);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["processes"][0]["name"], "idle");
        assert_eq!(json["processes"][0]["state"], "STOPPED");
        assert_eq!(json["state"], "RESTARTING");
    }
}
