//! A UNIX process supervisor.
//!
//! The crate starts configured child processes, watches them through a
//! single-threaded poll reactor, restarts them according to policy and
//! takes them down in an orderly fashion on shutdown. [`Supervisor`]
//! is the entry point; everything underneath it (process groups,
//! processes, pipe dispatchers, the signal latch) is wired explicitly
//! at construction time.

pub mod config;
pub mod context;
pub mod dispatchers;
pub mod error;
pub mod events;
pub mod fds;
pub mod groups;
pub mod io;
pub mod logging;
pub mod pipes;
pub mod poller;
pub mod process;
pub mod signals;
pub mod spawning;
pub mod states;
pub mod status;
pub mod supervisor;
pub mod users;

pub use config::{AutoRestart, LogConfig, ProcessConfig, ProcessGroupConfig, ServerConfig};
pub use error::{SpawnError, SupervisorError, SupervisorResult};
pub use events::{Channel, Event, EventBus};
pub use groups::{GroupDiff, ProcessGroup, ProcessGroupManager};
pub use process::Process;
pub use states::{ProcessState, SupervisorState};
pub use status::{ProcessStatus, SupervisorStatus};
pub use supervisor::Supervisor;
