//! A child that ignores the stop signal is escalated to SIGKILL after
//! stop_wait_secs.

mod common;

use std::time::{Duration, Instant};

use supervisor::{ProcessConfig, ProcessState, SupervisorState};

#[test]
fn test_term_ignoring_child_is_killed_after_stop_wait() {
    // Arrange: the shell traps and ignores SIGTERM.
    let mut config = ProcessConfig::new("stubborn", "sh -c 'trap \"\" TERM; sleep 60'");
    config.start_secs = 0;
    config.stop_wait_secs = 1;
    let mut supervisor = common::started_supervisor(vec![config]).unwrap();

    let running = common::drive_until(&mut supervisor, Duration::from_secs(10), |s| {
        common::process_state(s, "stubborn") == ProcessState::Running
    });
    assert!(running, "child never reached RUNNING");

    // Act
    let stop_requested = Instant::now();
    supervisor.shutdown();
    let finished = common::drive_to_completion(&mut supervisor, Duration::from_secs(15));

    // Assert: SIGTERM was ignored, so the stop took at least
    // stop_wait_secs before SIGKILL ended it.
    assert!(finished, "shutdown never completed");
    assert!(stop_requested.elapsed() >= Duration::from_secs(1));
    assert_eq!(common::process_state(&supervisor, "stubborn"), ProcessState::Stopped);
    assert_eq!(supervisor.state(), SupervisorState::Shutdown);
}
