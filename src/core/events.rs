//! Change notifications for observers of the state tree.
//!
//! Every mutating operation emits a [`StateEvent`] once it has succeeded.
//! Events are delivered to the observers of the changed state and then to
//! the observers of each of its ancestors, so subscribing to a root is
//! enough to follow the whole tree. Nothing in the core depends on whether
//! anyone is listening.

use super::ids::{DataFlowId, OutcomeId, PortId, StateId, TransitionId};
use super::port::PortDirection;
use parking_lot::Mutex;

/// What changed.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    PortAdded { id: PortId, direction: PortDirection },
    PortRemoved { id: PortId, direction: PortDirection },
    OutcomeAdded { id: OutcomeId },
    OutcomeRemoved { id: OutcomeId },
    OutcomeRenamed { id: OutcomeId, name: String },
    ChildAdded { id: StateId },
    ChildRemoved { id: StateId },
    StartStateChanged { id: Option<StateId> },
    TransitionAdded { id: TransitionId },
    TransitionRemoved { id: TransitionId },
    DataFlowAdded { id: DataFlowId },
    DataFlowRemoved { id: DataFlowId },
    IdChanged { old: StateId, new: StateId },
    NameChanged { name: String },
    DescriptionChanged,
    ActiveChanged { active: bool },
    Preempted,
}

/// A change together with the state it happened on.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEvent {
    /// Id of the state that changed.
    pub state_id: StateId,
    /// Path of the state at the time of the change.
    pub path: String,
    pub change: StateChange,
}

/// Receiver of change notifications.
pub trait StateObserver: Send + Sync {
    fn on_event(&self, event: &StateEvent);
}

/// Observer that keeps every event it receives. Handy for tests and for
/// hosts that poll for changes.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<StateEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StateEvent> {
        self.events.lock().clone()
    }

    /// Remove and return all recorded events.
    pub fn drain(&self) -> Vec<StateEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl StateObserver for EventLog {
    fn on_event(&self, event: &StateEvent) {
        self.events.lock().push(event.clone());
    }
}
