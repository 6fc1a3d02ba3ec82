//! A single supervised process and its lifecycle state machine.
//!
//! Every public mutator has an `_at` variant taking the current time
//! as an argument; the wrapper methods pass `Instant::now()`. Tests
//! drive the `_at` variants with synthetic clocks so backoff delays
//! and kill escalation are checked without sleeping.

use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::config::{AutoRestart, ProcessConfig, ServerConfig};
use crate::dispatchers::{Dispatcher, DispatcherMap, FdDispatcher};
use crate::events::{Event, EventBus};
use crate::fds::{decode_wait_status, signame};
use crate::pipes::ProcessPipes;
use crate::spawning;
use crate::states::{ProcessState, SupervisorState};

/// Identifies the process owning a live pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessKey {
    pub group: String,
    pub name: String,
}

/// Live pids mapped back to the processes that own them, so a reaped
/// pid can be routed to the right [`Process::finish`].
pub type PidHistory = HashMap<Pid, ProcessKey>;

/// Seconds between repeated "waiting for x to stop" reports.
const STOP_REPORT_INTERVAL: Duration = Duration::from_secs(2);

pub struct Process {
    pub(crate) config: ProcessConfig,
    name: String,
    group_name: String,
    server: Rc<ServerConfig>,
    bus: EventBus,

    state: ProcessState,
    pid: Option<Pid>,
    /// Number of consecutive BACKOFF entries since the last RUNNING.
    backoff: u32,
    last_start: Option<Instant>,
    last_stop: Option<Instant>,
    last_stop_report: Option<Instant>,
    /// Deadline for the next timed action: spawn retry while in
    /// BACKOFF, RUNNING promotion while STARTING, SIGKILL escalation
    /// while STOPPING.
    delay: Option<Instant>,
    /// A stop request is in flight.
    killing: bool,
    /// Stopped by an operator rather than by exiting on its own.
    administrative_stop: bool,
    /// Stopped by the supervisor because it could not be started.
    system_stop: bool,
    exit_status: Option<i32>,
    spawn_err: Option<String>,

    pipes: ProcessPipes,
    pub(crate) dispatchers: DispatcherMap,
}

impl Process {
    pub fn new(
        name: impl Into<String>,
        group_name: impl Into<String>,
        config: ProcessConfig,
        server: Rc<ServerConfig>,
        bus: EventBus,
    ) -> Self {
        Process {
            config,
            name: name.into(),
            group_name: group_name.into(),
            server,
            bus,
            state: ProcessState::Stopped,
            pid: None,
            backoff: 0,
            last_start: None,
            last_stop: None,
            last_stop_report: None,
            delay: None,
            killing: false,
            administrative_stop: false,
            system_stop: false,
            exit_status: None,
            spawn_err: None,
            pipes: ProcessPipes::default(),
            dispatchers: DispatcherMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn spawn_err(&self) -> Option<&str> {
        self.spawn_err.as_deref()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    /// Move to a new state, enforcing the transition table.
    ///
    /// Returns false when already in the target state. An illegal
    /// transition is a bug in the caller and panics.
    fn change_state_at(&mut self, new: ProcessState, expected: bool, now: Instant) -> bool {
        let old = self.state;
        if new == old {
            return false;
        }
        assert!(
            old.can_transition_to(new),
            "process {:?} attempted illegal transition {old} -> {new}",
            self.name
        );
        self.state = new;
        if new == ProcessState::Backoff {
            self.backoff += 1;
            self.delay = Some(now + Duration::from_secs(self.backoff as u64));
        }
        self.bus.post(Event::ProcessState {
            process: self.name.clone(),
            group: self.group_name.clone(),
            pid: self.pid.map(Pid::as_raw),
            from: old,
            to: new,
            expected,
            tries: self.backoff,
        });
        true
    }

    fn check_in_state(&self, allowed: &[ProcessState]) {
        assert!(
            allowed.contains(&self.state),
            "process {:?} in unexpected state {}, expected one of {:?}",
            self.name,
            self.state,
            allowed
        );
    }

    fn record_spawn_err(&mut self, msg: String, now: Instant) {
        info!("spawnerr: {msg}");
        self.spawn_err = Some(msg);
        self.check_in_state(&[ProcessState::Starting]);
        self.change_state_at(ProcessState::Backoff, false, now);
    }

    pub fn spawn(&mut self, pid_history: &mut PidHistory) -> Option<Pid> {
        self.spawn_at(Instant::now(), pid_history)
    }

    /// Start the child. On failure the process enters BACKOFF with the
    /// reason recorded; the spawn error never propagates further.
    pub fn spawn_at(&mut self, now: Instant, pid_history: &mut PidHistory) -> Option<Pid> {
        if let Some(pid) = self.pid {
            warn!("process {:?} already running with pid {pid}", self.name);
            return None;
        }
        self.killing = false;
        self.spawn_err = None;
        self.exit_status = None;
        self.system_stop = false;
        self.administrative_stop = false;
        self.last_start = Some(now);

        self.check_in_state(&[
            ProcessState::Exited,
            ProcessState::Fatal,
            ProcessState::Backoff,
            ProcessState::Stopped,
        ]);
        self.change_state_at(ProcessState::Starting, true, now);

        match spawning::spawn_process(&self.name, &self.group_name, &self.config, &self.server, &self.bus)
        {
            Ok(spawned) => {
                self.pid = Some(spawned.pid);
                self.pipes = spawned.pipes;
                self.dispatchers = spawned.dispatchers;
                self.delay = Some(now + Duration::from_secs(self.config.start_secs));
                pid_history.insert(
                    spawned.pid,
                    ProcessKey {
                        group: self.group_name.clone(),
                        name: self.name.clone(),
                    },
                );
                Some(spawned.pid)
            }
            Err(err) => {
                self.record_spawn_err(err.to_string(), now);
                None
            }
        }
    }

    pub fn transition(&mut self, supervisor_state: SupervisorState, pid_history: &mut PidHistory) {
        self.transition_at(Instant::now(), supervisor_state, pid_history);
    }

    /// Advance the state machine for the passage of time.
    ///
    /// The state is captured on entry: a respawn performed by the
    /// first half must not trip the timed checks in the second half
    /// during the same call.
    pub fn transition_at(
        &mut self,
        now: Instant,
        supervisor_state: SupervisorState,
        pid_history: &mut PidHistory,
    ) {
        let state = self.state;

        if supervisor_state > SupervisorState::Restarting {
            match state {
                ProcessState::Exited => {
                    let respawn = match self.config.auto_restart {
                        AutoRestart::Always => true,
                        AutoRestart::Unexpected => self
                            .exit_status
                            .map_or(true, |es| !self.config.exitcodes.contains(&es)),
                        AutoRestart::Never => false,
                    };
                    if respawn {
                        self.spawn_at(now, pid_history);
                    }
                }
                ProcessState::Stopped if self.last_start.is_none() => {
                    if self.config.auto_start {
                        self.spawn_at(now, pid_history);
                    }
                }
                ProcessState::Backoff => {
                    if self.backoff <= self.config.start_retries
                        && self.delay.is_some_and(|delay| now >= delay)
                    {
                        self.spawn_at(now, pid_history);
                    }
                }
                _ => {}
            }
        }

        if state == ProcessState::Starting {
            let uptime = self
                .last_start
                .map_or(Duration::ZERO, |start| now.saturating_duration_since(start));
            if uptime > Duration::from_secs(self.config.start_secs) {
                self.delay = None;
                self.backoff = 0;
                self.check_in_state(&[ProcessState::Starting]);
                self.change_state_at(ProcessState::Running, true, now);
                info!(
                    "success: {} entered RUNNING state, process has stayed up for > {} seconds",
                    self.name, self.config.start_secs
                );
            }
        }

        if state == ProcessState::Backoff {
            if self.backoff > self.config.start_retries {
                self.give_up_at(now);
                info!(
                    "gave up: {} entered FATAL state, too many start retries too quickly",
                    self.name
                );
            }
        } else if state == ProcessState::Stopping && self.delay.is_some_and(|delay| now >= delay) {
            // The stop signal was ignored; escalate.
            warn!(
                "killing {:?} ({}) with SIGKILL",
                self.name,
                self.pid.map_or(0, Pid::as_raw)
            );
            self.kill_with_at(Signal::SIGKILL, now);
        }
    }

    /// Abandon start attempts: BACKOFF becomes FATAL.
    pub(crate) fn give_up_at(&mut self, now: Instant) {
        self.delay = None;
        self.backoff = 0;
        self.system_stop = true;
        self.check_in_state(&[ProcessState::Backoff]);
        self.change_state_at(ProcessState::Fatal, true, now);
    }

    pub fn stop(&mut self) -> Option<String> {
        self.stop_at(Instant::now())
    }

    /// Operator-initiated stop with the configured stop signal.
    pub fn stop_at(&mut self, now: Instant) -> Option<String> {
        self.administrative_stop = true;
        self.last_stop_report = None;
        self.kill_with_at(self.config.stop_signal(), now)
    }

    /// Log a throttled progress report while waiting for a stop.
    pub fn stop_report_at(&mut self, now: Instant) {
        if self.state != ProcessState::Stopping {
            return;
        }
        let due = self
            .last_stop_report
            .map_or(true, |last| now.saturating_duration_since(last) >= STOP_REPORT_INTERVAL);
        if due {
            info!("waiting for {} to stop", self.name);
            self.last_stop_report = Some(now);
        }
    }

    /// Send `sig` to the child (or its process group) and enter
    /// STOPPING. Returns a message only when something went wrong.
    pub fn kill_with_at(&mut self, sig: Signal, now: Instant) -> Option<String> {
        // A process in BACKOFF has no pid; stopping it just cancels
        // the pending retry.
        if self.state == ProcessState::Backoff {
            warn!("attempted to kill {} which is in BACKOFF state", self.name);
            self.delay = None;
            self.backoff = 0;
            self.change_state_at(ProcessState::Stopped, true, now);
            return None;
        }
        let Some(pid) = self.pid else {
            let msg = format!(
                "attempted to kill {} with sig {} but it wasn't running",
                self.name,
                signame(sig as i32)
            );
            debug!("{msg}");
            return Some(msg);
        };

        let as_group = if sig == Signal::SIGKILL {
            self.config.kill_as_group || self.config.stop_as_group
        } else {
            self.config.stop_as_group
        };
        info!(
            "killing {} (pid {pid}){} with signal {}",
            self.name,
            if as_group { " process group" } else { "" },
            signame(sig as i32)
        );

        self.killing = true;
        self.delay = Some(now + Duration::from_secs(self.config.stop_wait_secs));
        self.check_in_state(&[
            ProcessState::Running,
            ProcessState::Starting,
            ProcessState::Stopping,
        ]);
        self.change_state_at(ProcessState::Stopping, true, now);

        let sent = if as_group {
            signal::killpg(pid, sig)
        } else {
            signal::kill(pid, sig)
        };
        match sent {
            Ok(()) => None,
            Err(Errno::ESRCH) => {
                debug!(
                    "unable to signal {} (pid {pid}), it probably just exited on its own",
                    self.name
                );
                None
            }
            Err(errno) => {
                let msg = format!("unknown problem killing {} (pid {pid}): {errno}", self.name);
                warn!("{msg}");
                self.change_state_at(ProcessState::Unknown, false, now);
                self.killing = false;
                self.delay = None;
                Some(msg)
            }
        }
    }

    /// Deliver an arbitrary signal without touching the state machine.
    pub fn signal(&mut self, sig: Signal) -> Option<String> {
        let Some(pid) = self.pid else {
            let msg = format!(
                "attempted to send {} sig {} but it wasn't running",
                self.name,
                signame(sig as i32)
            );
            debug!("{msg}");
            return Some(msg);
        };
        info!("sending signal {} to {} (pid {pid})", signame(sig as i32), self.name);
        self.check_in_state(&[
            ProcessState::Running,
            ProcessState::Starting,
            ProcessState::Stopping,
        ]);
        match signal::kill(pid, sig) {
            Ok(()) => None,
            Err(Errno::ESRCH) => {
                debug!(
                    "unable to signal {} (pid {pid}), it probably just exited on its own",
                    self.name
                );
                None
            }
            Err(errno) => {
                let msg = format!("unknown problem signaling {} (pid {pid}): {errno}", self.name);
                warn!("{msg}");
                self.change_state_at(ProcessState::Unknown, false, Instant::now());
                Some(msg)
            }
        }
    }

    /// Queue bytes for the child's stdin.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.pid.is_none() || self.killing {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "process already closed"));
        }
        let fd = self
            .pipes
            .stdin_fd()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "process has no stdin"))?;
        let dispatcher = self
            .dispatchers
            .get_mut(&fd)
            .and_then(Dispatcher::as_input_mut)
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed"))?;
        dispatcher.queue(data)
    }

    /// Pull any bytes still sitting in the output pipes. Called before
    /// the pipes are torn down so the tail of a child's output is not
    /// lost.
    fn drain(&mut self) {
        for dispatcher in self.dispatchers.values_mut() {
            while dispatcher.readable() {
                if dispatcher.on_readable().is_err() {
                    dispatcher.close();
                }
            }
            if dispatcher.writable() {
                let _ = dispatcher.on_writable();
            }
        }
    }

    pub fn finish(&mut self, sts: i32) {
        self.finish_at(Instant::now(), sts);
    }

    /// The child was reaped with wait status `sts`.
    pub fn finish_at(&mut self, now: Instant, sts: i32) {
        self.drain();

        let (es, msg) = decode_wait_status(sts);
        self.last_stop = Some(now);

        let too_quickly = self.last_start.is_some_and(|start| {
            now.saturating_duration_since(start) < Duration::from_secs(self.config.start_secs)
        });

        if self.killing {
            // The result of a stop request.
            self.killing = false;
            self.delay = None;
            self.exit_status = Some(es);
            self.check_in_state(&[ProcessState::Stopping]);
            self.change_state_at(ProcessState::Stopped, true, now);
            info!("stopped: {} ({msg})", self.name);
        } else if too_quickly {
            // Did not stay up long enough to make it to RUNNING.
            self.exit_status = None;
            self.spawn_err = Some("Exited too quickly (process log may have details)".to_string());
            self.check_in_state(&[ProcessState::Starting]);
            self.change_state_at(ProcessState::Backoff, false, now);
            warn!("exited: {} ({msg}); not expected", self.name);
        } else {
            self.delay = None;
            self.backoff = 0;
            self.exit_status = Some(es);
            // The exit may arrive before a transition() promoted the
            // process; bridge STARTING to RUNNING implicitly.
            if self.state == ProcessState::Starting {
                self.change_state_at(ProcessState::Running, true, now);
            }
            self.check_in_state(&[ProcessState::Running]);
            if self.config.exitcodes.contains(&es) {
                self.change_state_at(ProcessState::Exited, true, now);
                info!("exited: {} ({msg}); expected", self.name);
            } else {
                self.change_state_at(ProcessState::Exited, false, now);
                warn!("exited: {} ({msg}); not expected", self.name);
            }
        }

        self.pid = None;
        self.pipes = ProcessPipes::default();
        self.dispatchers = DispatcherMap::new();
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("group", &self.group_name)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("backoff", &self.backoff)
            .finish()
    }
}
