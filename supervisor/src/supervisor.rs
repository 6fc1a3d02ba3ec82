//! The supervisor: ties the process groups, the reactor and the
//! signal latch into one single-threaded main loop.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::config::{ProcessGroupConfig, ServerConfig};
use crate::context::ServerContext;
use crate::error::SupervisorResult;
use crate::events::{Event, EventBus};
use crate::groups::ProcessGroupManager;
use crate::io::IoManager;
use crate::states::SupervisorState;

/// Periods (in seconds) for which tick events are emitted.
const TICK_PERIODS: &[u64] = &[5, 60, 3600];

/// Ceiling on consecutive reaps in one loop iteration, so a stampede
/// of exiting children cannot starve the rest of the loop.
const REAP_LIMIT: u32 = 100;

/// Seconds between repeated "waiting for x to die" reports.
const SHUTDOWN_REPORT_INTERVAL: Duration = Duration::from_secs(3);

/// Start of the timeslice `when` falls into.
pub fn timeslice(period: u64, when: u64) -> u64 {
    when - when % period
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct Supervisor {
    context: ServerContext,
    groups: ProcessGroupManager,
    io: IoManager,
    bus: EventBus,
    /// Shutdown sequencing has begun.
    stopping: bool,
    /// Groups not yet fully stopped, in stop order.
    stop_groups: Vec<String>,
    last_shutdown_report: Option<Instant>,
    /// Last emitted timeslice per tick period.
    ticks: HashMap<u64, u64>,
}

impl Supervisor {
    pub fn new(config: ServerConfig) -> SupervisorResult<Self> {
        let bus = EventBus::new();
        let context = ServerContext::new(config);
        let mut groups = ProcessGroupManager::new(bus.clone());
        let group_configs = context.config().groups.clone();
        for group_config in &group_configs {
            groups.add_group(group_config, context.config())?;
        }
        Ok(Supervisor {
            context,
            groups,
            io: IoManager::new(),
            bus,
            stopping: false,
            stop_groups: Vec::new(),
            last_shutdown_report: None,
            ticks: HashMap::new(),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn identifier(&self) -> &str {
        &self.context.config().identifier
    }

    pub fn state(&self) -> SupervisorState {
        self.context.state
    }

    pub fn groups(&self) -> &ProcessGroupManager {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut ProcessGroupManager {
        &mut self.groups
    }

    pub fn add_group(&mut self, config: &ProcessGroupConfig) -> SupervisorResult<()> {
        let server = self.context.config().clone();
        self.groups.add_group(config, &server)
    }

    pub fn remove_group(&mut self, name: &str) -> SupervisorResult<()> {
        self.groups.remove_group(name)
    }

    /// Begin supervising: autostart processes will spawn on the next
    /// loop iteration.
    pub fn activate(&mut self) {
        self.context.state = SupervisorState::Running;
        self.bus.post(Event::SupervisorRunning);
    }

    /// Request an orderly shutdown, as SIGTERM would.
    pub fn shutdown(&mut self) {
        self.context.state = SupervisorState::Shutdown;
    }

    /// Request a restart, as SIGHUP would.
    pub fn restart(&mut self) {
        self.context.state = SupervisorState::Restarting;
    }

    /// Full lifecycle: set up the environment, loop until a shutdown
    /// or restart request has been carried out, tear down. Returns the
    /// final state so the caller can distinguish restart from exit.
    pub fn run(&mut self) -> SupervisorResult<SupervisorState> {
        self.context.set_rlimits()?;
        self.context.cleanup_fds();
        self.context.set_uid()?;
        if !self.context.config().nodaemon {
            self.context.daemonize()?;
        }
        self.context.write_pidfile()?;
        self.context.signals.install()?;
        self.activate();

        while self.run_once() {}

        let final_state = self.context.state;
        self.io.clear();
        self.context.signals.uninstall();
        self.context.unlink_pidfile();
        Ok(final_state)
    }

    pub fn run_once(&mut self) -> bool {
        self.run_once_at(Instant::now(), epoch_now(), Duration::from_secs(1))
    }

    /// One iteration of the main loop. Returns false when shutdown
    /// sequencing has finished and the loop should exit.
    pub fn run_once_at(&mut self, now: Instant, epoch: u64, timeout: Duration) -> bool {
        if self.context.state < SupervisorState::Running {
            if !self.stopping {
                self.stopping = true;
                self.stop_groups = self
                    .groups
                    .groups()
                    .iter()
                    .rev()
                    .map(|g| g.name().to_string())
                    .collect();
                info!("stopping all processes");
                self.bus.post(Event::SupervisorStopping);
            }
            self.ordered_stop_groups_phase_1(now);
            if !self.shutdown_report_at(now) {
                // Everything has stopped; the loop is done.
                return false;
            }
        }

        let mut dispatchers = self.groups.dispatcher_map();
        self.io.run_cycle(&mut dispatchers, timeout);
        drop(dispatchers);

        self.reap_at(now);
        self.handle_signal();
        self.groups
            .transition_all_at(now, self.context.state, &mut self.context.pid_history);
        self.tick_at(epoch);

        if self.context.state < SupervisorState::Running {
            self.ordered_stop_groups_phase_2();
        }
        true
    }

    /// Keep asking the frontmost unstopped group to stop. One group at
    /// a time, so stop ordering between groups is preserved.
    fn ordered_stop_groups_phase_1(&mut self, now: Instant) {
        if let Some(name) = self.stop_groups.first().cloned() {
            if let Some(group) = self.groups.group_mut(&name) {
                group.stop_all_at(now);
            }
        }
    }

    /// Move on to the next group once the frontmost is fully stopped.
    fn ordered_stop_groups_phase_2(&mut self) {
        if let Some(name) = self.stop_groups.first().cloned() {
            let stopped = self
                .groups
                .group_mut(&name)
                .map_or(true, |group| group.all_stopped());
            if stopped {
                self.stop_groups.remove(0);
            }
        }
    }

    /// Report shutdown progress. Returns true while processes are
    /// still stopping.
    fn shutdown_report_at(&mut self, now: Instant) -> bool {
        let mut names: Vec<String> = Vec::new();
        for process in self.groups.unstopped_processes() {
            names.push(process.name().to_string());
            process.stop_report_at(now);
        }
        if names.is_empty() {
            return false;
        }
        let due = self.last_shutdown_report.map_or(true, |last| {
            now.saturating_duration_since(last) >= SHUTDOWN_REPORT_INTERVAL
        });
        if due {
            self.last_shutdown_report = Some(now);
            info!("waiting for {} to die", names.join(", "));
        }
        true
    }

    /// Collect exited children and route each to its process.
    fn reap_at(&mut self, now: Instant) {
        for _ in 0..REAP_LIMIT {
            let Some((pid, status)) = self.context.reap_one() else {
                return;
            };
            match self.context.pid_history.remove(&pid) {
                Some(key) => match self.groups.process_mut(&key.group, &key.name) {
                    Some(process) => process.finish_at(now, status),
                    None => warn!(
                        "reaped pid {pid} for vanished process {}:{}",
                        key.group, key.name
                    ),
                },
                None => {
                    let (_, msg) = crate::fds::decode_wait_status(status);
                    info!("reaped unknown pid {pid} ({msg})");
                }
            }
        }
    }

    /// Act on at most one pending signal per loop iteration.
    fn handle_signal(&mut self) {
        let Some(sig) = self.context.signals.get_signal() else {
            return;
        };
        match sig {
            Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT => {
                warn!("received {} indicating exit request", sig.as_str());
                self.context.state = SupervisorState::Shutdown;
            }
            Signal::SIGHUP => {
                if self.context.state == SupervisorState::Shutdown {
                    warn!("ignored SIGHUP indicating restart request (shutdown in progress)");
                } else {
                    warn!("received SIGHUP indicating restart request");
                    self.context.state = SupervisorState::Restarting;
                }
            }
            Signal::SIGCHLD => {
                debug!("received SIGCHLD indicating a child quit");
            }
            Signal::SIGUSR2 => {
                info!("received SIGUSR2 indicating log reopen request");
                for (_, dispatcher) in self.groups.dispatcher_map() {
                    dispatcher.reopen_log();
                }
            }
            other => {
                debug!("received {} indicating nothing", other.as_str());
            }
        }
    }

    /// Emit tick events, exactly once per elapsed timeslice.
    pub(crate) fn tick_at(&mut self, epoch: u64) {
        for &period in TICK_PERIODS {
            let this_tick = timeslice(period, epoch);
            match self.ticks.get(&period) {
                None => {
                    // First observation only establishes the baseline.
                    self.ticks.insert(period, this_tick);
                }
                Some(&last_tick) if last_tick != this_tick => {
                    self.ticks.insert(period, this_tick);
                    self.bus.post(Event::Tick {
                        period,
                        when: this_tick,
                    });
                }
                Some(_) => {}
            }
        }
    }
}
