//! Process and supervisor lifecycle states.
//!
//! Every process owned by the supervisor is in exactly one
//! [`ProcessState`] at any time, and may only move between states along
//! the edges of a fixed transition table. A transition outside the
//! table is a programming error, not a runtime condition.

use serde::Serialize;

/// Lifecycle state of a single supervised process.
///
/// The numeric values are ordered so that set-membership checks
/// (`is_stopped`, `is_running`, `is_signalable`) stay cheap and the
/// values can be exposed verbatim in status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessState {
    Stopped = 0,
    Starting = 10,
    Running = 20,
    Backoff = 30,
    Stopping = 40,
    Exited = 100,
    Fatal = 200,
    Unknown = 1000,
}

impl ProcessState {
    /// States in which the process is not running and will not run
    /// without an explicit or automatic start.
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            ProcessState::Stopped | ProcessState::Exited | ProcessState::Fatal | ProcessState::Unknown
        )
    }

    /// States counted as "running" for start/stop bookkeeping.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ProcessState::Running | ProcessState::Backoff | ProcessState::Starting
        )
    }

    /// States in which the process has a pid that may be signaled.
    pub fn is_signalable(self) -> bool {
        matches!(
            self,
            ProcessState::Running | ProcessState::Starting | ProcessState::Stopping
        )
    }

    /// Legal successor states.
    pub fn legal_successors(self) -> &'static [ProcessState] {
        use ProcessState::*;
        match self {
            Stopped => &[Starting],
            Starting => &[Running, Backoff, Stopping, Unknown],
            Running => &[Stopping, Exited, Unknown],
            Backoff => &[Starting, Fatal, Stopped],
            Stopping => &[Stopped, Unknown],
            Exited => &[Starting],
            Fatal => &[Starting],
            Unknown => &[],
        }
    }

    pub fn can_transition_to(self, to: ProcessState) -> bool {
        self.legal_successors().contains(&to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "STOPPED",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Backoff => "BACKOFF",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Exited => "EXITED",
            ProcessState::Fatal => "FATAL",
            ProcessState::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the supervisor itself.
///
/// Ordering matters: the main loop only starts new children while the
/// state is [`SupervisorState::Running`]; anything below `Running`
/// triggers shutdown sequencing. The derive relies on declaration
/// order, which matches the numeric ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SupervisorState {
    Shutdown = -1,
    Restarting = 0,
    Running = 1,
    Fatal = 2,
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            SupervisorState::Shutdown => "SHUTDOWN",
            SupervisorState::Restarting => "RESTARTING",
            SupervisorState::Running => "RUNNING",
            SupervisorState::Fatal => "FATAL",
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_sets() {
        for state in [
            ProcessState::Stopped,
            ProcessState::Exited,
            ProcessState::Fatal,
            ProcessState::Unknown,
        ] {
            assert!(state.is_stopped());
            assert!(!state.is_running());
        }
        for state in [ProcessState::Running, ProcessState::Backoff, ProcessState::Starting] {
            assert!(state.is_running());
            assert!(!state.is_stopped());
        }
        for state in [ProcessState::Running, ProcessState::Starting, ProcessState::Stopping] {
            assert!(state.is_signalable());
        }
        assert!(!ProcessState::Backoff.is_signalable());
    }

    #[test]
    fn test_transition_table_edges() {
        use ProcessState::*;

        // Every spawn source may enter STARTING.
        for from in [Exited, Fatal, Backoff, Stopped] {
            assert!(from.can_transition_to(Starting), "{from} -> STARTING");
        }
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Backoff));
        assert!(Starting.can_transition_to(Stopping));
        assert!(Running.can_transition_to(Exited));
        assert!(Backoff.can_transition_to(Fatal));
        assert!(Backoff.can_transition_to(Stopped));
        assert!(Stopping.can_transition_to(Stopped));

        // A process that never started cannot jump straight to RUNNING.
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Unknown.can_transition_to(Running));
        assert!(Unknown.legal_successors().is_empty());
    }

    #[test]
    fn test_supervisor_state_ordering() {
        assert!(SupervisorState::Shutdown < SupervisorState::Running);
        assert!(SupervisorState::Restarting < SupervisorState::Running);
        assert!(SupervisorState::Running < SupervisorState::Fatal);
        assert!(SupervisorState::Running > SupervisorState::Restarting);
    }
}
