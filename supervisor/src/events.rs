//! Supervision events and the single-threaded event bus.
//!
//! Everything interesting the engine does is published as an [`Event`]
//! so downstream consumers (log sinks, status listeners) can observe
//! process lifecycles without reaching into the state machine. The bus
//! is an explicit object wired through the graph at construction time;
//! there is no global registry.

use std::cell::RefCell;
use std::rc::Rc;

use crate::states::ProcessState;

/// Channel of a child's standard I/O a dispatcher is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Stdout,
    Stderr,
    Stdin,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
            Channel::Stdin => "stdin",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token opening a communication-event capture in child output.
pub const CAPTURE_BEGIN_TOKEN: &[u8] = b"<!--XSUPERVISOR:BEGIN-->";
/// Token closing a communication-event capture in child output.
pub const CAPTURE_END_TOKEN: &[u8] = b"<!--XSUPERVISOR:END-->";

#[derive(Debug, Clone)]
pub enum Event {
    /// A process moved between lifecycle states.
    ProcessState {
        process: String,
        group: String,
        pid: Option<i32>,
        from: ProcessState,
        to: ProcessState,
        /// False when the change was caused by an unexpected exit code
        /// or a too-quick exit.
        expected: bool,
        /// Backoff counter at the time of the change.
        tries: u32,
    },

    /// A chunk of child output on a channel with events enabled.
    ProcessLog {
        process: String,
        group: String,
        pid: i32,
        channel: Channel,
        data: Vec<u8>,
    },

    /// A complete capture-token-delimited communication payload.
    ProcessCommunication {
        process: String,
        group: String,
        pid: i32,
        channel: Channel,
        data: Vec<u8>,
    },

    SupervisorRunning,
    SupervisorStopping,

    ProcessGroupAdded { group: String },
    ProcessGroupRemoved { group: String },

    /// Periodic marker; `when` is the timeslice start in epoch seconds.
    Tick { period: u64, when: u64 },
}

type EventCallback = Box<dyn Fn(&Event)>;

/// Fan-out bus for [`Event`]s.
///
/// Cloning is cheap and shares the subscriber list; the engine runs on
/// one thread, so plain `Rc`/`RefCell` sharing is all that is needed.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Rc<RefCell<Vec<EventCallback>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn subscribe(&self, callback: impl Fn(&Event) + 'static) {
        self.subscribers.borrow_mut().push(Box::new(callback));
    }

    pub fn post(&self, event: Event) {
        for callback in self.subscribers.borrow().iter() {
            callback(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_fans_out_to_all_subscribers() {
        let bus = EventBus::new();
        let seen_a = Rc::new(RefCell::new(0u32));
        let seen_b = Rc::new(RefCell::new(0u32));

        let a = seen_a.clone();
        bus.subscribe(move |_| *a.borrow_mut() += 1);
        let b = seen_b.clone();
        bus.subscribe(move |_| *b.borrow_mut() += 1);

        bus.post(Event::SupervisorRunning);
        bus.post(Event::SupervisorStopping);

        assert_eq!(*seen_a.borrow(), 2);
        assert_eq!(*seen_b.borrow(), 2);
    }

    #[test]
    fn test_clones_share_subscribers() {
        let bus = EventBus::new();
        let other = bus.clone();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = seen.clone();
        bus.subscribe(move |event| {
            if let Event::Tick { period, .. } = event {
                s.borrow_mut().push(*period);
            }
        });

        other.post(Event::Tick { period: 5, when: 100 });
        assert_eq!(*seen.borrow(), vec![5]);
    }
}
