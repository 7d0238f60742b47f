//! Pool lifecycle events.
//!
//! Execution units publish a fixed set of events around the moments that
//! matter to embedders: unit start/stop, fork, terminate, kill. Publishing
//! is fire-and-forget through an [`EventSink`]; sinks must not block
//! meaningfully and must not panic, because they are called from inside the
//! run-loop with a state in flight.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::registry::StateId;
use crate::worker::UnitId;

/// One lifecycle notification. `Will*` events fire before the registry
/// transition they announce, `Did*` events after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolEvent {
    WillStartWorker {
        unit: UnitId,
    },
    DidTerminateWorker {
        unit: UnitId,
    },
    /// A decision point is about to be resolved into `branches` successors.
    WillForkState {
        id: StateId,
        branches: usize,
    },
    /// Fork complete; `children` hold the successor ids in branch order.
    DidForkState {
        id: StateId,
        children: Vec<StateId>,
    },
    WillTerminateState {
        id: StateId,
        reason: String,
    },
    DidTerminateState {
        id: StateId,
    },
    WillKillState {
        id: StateId,
        reason: String,
    },
    DidKillState {
        id: StateId,
    },
}

impl PoolEvent {
    /// The event's stable name, for logs and summaries.
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::WillStartWorker { .. } => "will_start_worker",
            PoolEvent::DidTerminateWorker { .. } => "did_terminate_worker",
            PoolEvent::WillForkState { .. } => "will_fork_state",
            PoolEvent::DidForkState { .. } => "did_fork_state",
            PoolEvent::WillTerminateState { .. } => "will_terminate_state",
            PoolEvent::DidTerminateState { .. } => "did_terminate_state",
            PoolEvent::WillKillState { .. } => "will_kill_state",
            PoolEvent::DidKillState { .. } => "did_kill_state",
        }
    }
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where units publish their lifecycle events.
///
/// Implementations are shared across units behind an `Arc`, so `publish`
/// takes `&self` and must be safe under concurrent callers.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: PoolEvent);
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: PoolEvent) {}
}

/// Sink that appends every event to a shared in-memory log.
///
/// Clones share the same buffer, so one handle can be given to the engine
/// while a test keeps another to inspect afterwards.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<PoolEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all recorded events, clearing the log.
    pub fn drain(&self) -> Vec<PoolEvent> {
        let mut events = self.events.lock().unwrap();
        std::mem::take(&mut *events)
    }

    /// Snapshot of recorded events without clearing.
    pub fn peek(&self) -> Vec<PoolEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

impl EventSink for EventLog {
    fn publish(&self, event: PoolEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_log_records_in_order() {
        let log = EventLog::new();
        log.publish(PoolEvent::WillStartWorker { unit: 0 });
        log.publish(PoolEvent::WillTerminateState {
            id: 4,
            reason: "done".to_string(),
        });
        log.publish(PoolEvent::DidTerminateWorker { unit: 0 });

        assert_eq!(log.len(), 3);
        let names: Vec<&str> = log.peek().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            ["will_start_worker", "will_terminate_state", "did_terminate_worker"]
        );
    }

    #[test]
    fn drain_clears_the_log() {
        let log = EventLog::new();
        log.publish(PoolEvent::DidKillState { id: 1 });

        assert_eq!(log.drain().len(), 1);
        assert!(log.is_empty());
        assert!(log.drain().is_empty());
    }

    #[test]
    fn clones_share_one_buffer() {
        let log = EventLog::new();
        let other = log.clone();
        other.publish(PoolEvent::DidForkState {
            id: 2,
            children: vec![3, 4],
        });
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn events_survive_json() {
        let event = PoolEvent::DidForkState {
            id: 9,
            children: vec![10, 11, 12],
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: PoolEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
