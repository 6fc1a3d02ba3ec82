//! A child that keeps exiting immediately burns through its start
//! retries and lands in FATAL.

mod common;

use std::time::Duration;

use supervisor::{ProcessConfig, ProcessState};

#[test]
fn test_crashing_child_ends_fatal_after_retries() {
    // Arrange: exits right away with a failure code, two retries.
    let mut config = ProcessConfig::new("crasher", "sh -c 'exit 1'");
    config.start_secs = 1;
    config.start_retries = 2;
    let mut supervisor = common::started_supervisor(vec![config]).unwrap();

    // Act: retry delays grow linearly (1s, 2s, 3s), so FATAL arrives
    // well within the deadline.
    let fatal = common::drive_until(&mut supervisor, Duration::from_secs(30), |s| {
        common::process_state(s, "crasher") == ProcessState::Fatal
    });

    // Assert
    assert!(fatal, "child never entered FATAL");
    let process = supervisor.groups().groups()[0]
        .processes()
        .iter()
        .find(|p| p.name() == "crasher")
        .unwrap();
    assert!(process.spawn_err().unwrap().contains("Exited too quickly"));

    // A FATAL process counts as stopped; shutdown is immediate.
    supervisor.shutdown();
    assert!(common::drive_to_completion(&mut supervisor, Duration::from_secs(5)));
}
