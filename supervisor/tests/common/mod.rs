//! Shared fixtures for the supervisor integration tests.
//!
//! Each scenario lives in its own test binary: the supervisor reaps
//! with `waitpid(-1)`, so children spawned by unrelated tests in the
//! same process would get mixed up.

use std::time::{Duration, Instant};

use supervisor::{
    ProcessConfig, ProcessGroupConfig, ProcessState, ServerConfig, Supervisor, SupervisorResult,
};

/// A foreground server config with a single "default" group.
pub fn server_config(processes: Vec<ProcessConfig>) -> ServerConfig {
    ServerConfig {
        nodaemon: true,
        min_fds: 64,
        groups: vec![ProcessGroupConfig {
            name: "default".to_string(),
            priority: 999,
            processes,
        }],
        ..ServerConfig::default()
    }
}

/// An activated supervisor ready to drive with `run_once`.
pub fn started_supervisor(processes: Vec<ProcessConfig>) -> SupervisorResult<Supervisor> {
    let mut supervisor = Supervisor::new(server_config(processes))?;
    supervisor.activate();
    Ok(supervisor)
}

/// State of the single process in the "default" group.
pub fn process_state(supervisor: &Supervisor, name: &str) -> ProcessState {
    supervisor
        .groups()
        .groups()
        .iter()
        .flat_map(|group| group.processes())
        .find(|process| process.name() == name)
        .unwrap_or_else(|| panic!("no process named {name:?}"))
        .state()
}

/// Drive the main loop until `done` holds or the deadline passes.
pub fn drive_until(
    supervisor: &mut Supervisor,
    deadline: Duration,
    mut done: impl FnMut(&Supervisor) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        supervisor.run_once();
        if done(supervisor) {
            return true;
        }
    }
    false
}

/// Drive the main loop until it reports completion.
pub fn drive_to_completion(supervisor: &mut Supervisor, deadline: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if !supervisor.run_once() {
            return true;
        }
    }
    false
}
