//! Process groups and the collection managing them.
//!
//! A group materializes the process instances of its configuration
//! (`num_procs` expansion happens here) and applies lifecycle
//! operations across them in priority order.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

use tracing::info;

use crate::config::{ProcessGroupConfig, ServerConfig};
use crate::dispatchers::Dispatcher;
use crate::error::{SupervisorError, SupervisorResult};
use crate::events::{Event, EventBus};
use crate::process::{PidHistory, Process};
use crate::states::{ProcessState, SupervisorState};

pub struct ProcessGroup {
    config: ProcessGroupConfig,
    processes: Vec<Process>,
}

impl ProcessGroup {
    /// Build a group, expanding each program into `num_procs`
    /// instances. Instance names are `name_<i>` when more than one is
    /// requested.
    pub fn from_config(
        config: &ProcessGroupConfig,
        server: &Rc<ServerConfig>,
        bus: &EventBus,
    ) -> SupervisorResult<Self> {
        let mut processes = Vec::new();
        for program in &config.processes {
            for i in 0..program.num_procs.max(1) {
                let name = if program.num_procs > 1 {
                    format!("{}_{i}", program.name)
                } else {
                    program.name.clone()
                };
                if processes.iter().any(|p: &Process| p.name() == name) {
                    return Err(SupervisorError::DuplicateProcess {
                        group: config.name.clone(),
                        name,
                    });
                }
                processes.push(Process::new(
                    name,
                    config.name.clone(),
                    program.clone(),
                    server.clone(),
                    bus.clone(),
                ));
            }
        }
        // Start order: ascending priority, stable by name within a tie.
        processes.sort_by(|a, b| {
            a.config
                .priority
                .cmp(&b.config.priority)
                .then_with(|| a.name().cmp(b.name()))
        });
        Ok(ProcessGroup {
            config: config.clone(),
            processes,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    pub fn process_mut(&mut self, name: &str) -> Option<&mut Process> {
        self.processes.iter_mut().find(|p| p.name() == name)
    }

    pub fn transition_at(
        &mut self,
        now: Instant,
        supervisor_state: SupervisorState,
        pid_history: &mut PidHistory,
    ) {
        for process in &mut self.processes {
            process.transition_at(now, supervisor_state, pid_history);
        }
    }

    /// Ask every process to stop, highest priority first.
    pub fn stop_all_at(&mut self, now: Instant) {
        for process in self.processes.iter_mut().rev() {
            match process.state() {
                ProcessState::Running | ProcessState::Starting => {
                    process.stop_at(now);
                }
                ProcessState::Backoff => {
                    // No child to signal; cancel the pending retry.
                    process.give_up_at(now);
                }
                _ => {}
            }
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.processes.iter().all(Process::is_stopped)
    }

    /// Processes still holding a pid or waiting to get one.
    pub fn unstopped_processes(&mut self) -> impl Iterator<Item = &mut Process> {
        self.processes.iter_mut().filter(|p| !p.is_stopped())
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("name", &self.name())
            .field("priority", &self.priority())
            .field("processes", &self.processes.len())
            .finish()
    }
}

/// Result of comparing the current groups against a new set of group
/// configurations. Applying it is the caller's job.
#[derive(Debug, Default, PartialEq)]
pub struct GroupDiff {
    pub added: Vec<ProcessGroupConfig>,
    pub changed: Vec<ProcessGroupConfig>,
    pub removed: Vec<String>,
}

/// All process groups, kept sorted by priority.
#[derive(Debug, Default)]
pub struct ProcessGroupManager {
    groups: Vec<ProcessGroup>,
    bus: EventBus,
}

impl ProcessGroupManager {
    pub fn new(bus: EventBus) -> Self {
        ProcessGroupManager {
            groups: Vec::new(),
            bus,
        }
    }

    pub fn add_group(
        &mut self,
        config: &ProcessGroupConfig,
        server: &Rc<ServerConfig>,
    ) -> SupervisorResult<()> {
        if self.groups.iter().any(|g| g.name() == config.name) {
            return Err(SupervisorError::DuplicateGroup {
                name: config.name.clone(),
            });
        }
        let group = ProcessGroup::from_config(config, server, &self.bus)?;
        info!("added process group {:?}", group.name());
        self.groups.push(group);
        self.groups
            .sort_by(|a, b| a.priority().cmp(&b.priority()).then_with(|| a.name().cmp(b.name())));
        self.bus.post(Event::ProcessGroupAdded {
            group: config.name.clone(),
        });
        Ok(())
    }

    /// Remove a fully stopped group.
    pub fn remove_group(&mut self, name: &str) -> SupervisorResult<()> {
        let Some(index) = self.groups.iter().position(|g| g.name() == name) else {
            return Err(SupervisorError::InvalidConfig {
                field: "group".to_string(),
                value: name.to_string(),
            });
        };
        if !self.groups[index].all_stopped() {
            return Err(SupervisorError::InvalidConfig {
                field: "group".to_string(),
                value: format!("{name} still has running processes"),
            });
        }
        self.groups.remove(index);
        info!("removed process group {name:?}");
        self.bus.post(Event::ProcessGroupRemoved {
            group: name.to_string(),
        });
        Ok(())
    }

    pub fn groups(&self) -> &[ProcessGroup] {
        &self.groups
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut ProcessGroup> {
        self.groups.iter_mut().find(|g| g.name() == name)
    }

    pub fn process_mut(&mut self, group: &str, name: &str) -> Option<&mut Process> {
        self.group_mut(group).and_then(|g| g.process_mut(name))
    }

    pub fn transition_all_at(
        &mut self,
        now: Instant,
        supervisor_state: SupervisorState,
        pid_history: &mut PidHistory,
    ) {
        for group in &mut self.groups {
            group.transition_at(now, supervisor_state, pid_history);
        }
    }

    /// Stop every group, highest priority group first.
    pub fn stop_groups_at(&mut self, now: Instant) {
        for group in self.groups.iter_mut().rev() {
            group.stop_all_at(now);
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.groups.iter().all(ProcessGroup::all_stopped)
    }

    /// Compare the running groups with a new configuration, by name.
    pub fn diff(&self, new_configs: &[ProcessGroupConfig]) -> GroupDiff {
        let mut diff = GroupDiff::default();
        for config in new_configs {
            match self.groups.iter().find(|g| g.name() == config.name) {
                None => diff.added.push(config.clone()),
                Some(group) if group.config != *config => diff.changed.push(config.clone()),
                Some(_) => {}
            }
        }
        for group in &self.groups {
            if !new_configs.iter().any(|c| c.name == group.name()) {
                diff.removed.push(group.name().to_string());
            }
        }
        diff
    }

    /// Unstopped processes across every group, in group stop order.
    pub fn unstopped_processes(&mut self) -> impl Iterator<Item = &mut Process> {
        self.groups
            .iter_mut()
            .rev()
            .flat_map(|group| group.unstopped_processes())
    }

    /// Every live dispatcher across all groups, keyed by fd, for one
    /// reactor cycle.
    pub fn dispatcher_map(&mut self) -> HashMap<RawFd, &mut Dispatcher> {
        let mut map = HashMap::new();
        for group in &mut self.groups {
            for process in &mut group.processes {
                for (fd, dispatcher) in &mut process.dispatchers {
                    map.insert(*fd, dispatcher);
                }
            }
        }
        map
    }
}
