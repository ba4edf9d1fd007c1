//! Core state tree types.
//!
//! This module contains the structural side of a state machine:
//! - [`State`] and its variants, ports and outcomes
//! - Container structure: children, transitions, data flows, scoped variables
//! - Library references and resolvers
//! - Identifier allocation, change events and execution history
//!
//! Running a tree lives in [`crate::execution`].

mod container;
mod error;
mod events;
mod history;
mod ids;
mod library;
mod outcome;
mod port;
mod state;

pub use container::{DataFlow, Transition};
pub use error::{ElementKind, StateError};
pub use events::{EventLog, StateChange, StateEvent, StateObserver};
pub use history::{ExecutionHistory, ExecutionStep};
pub use ids::{DataFlowId, IdAllocator, IdStrategy, OutcomeId, PortId, StateId, TransitionId};
pub use library::{InMemoryLibrary, LibraryReference, LibraryResolver};
pub use outcome::{
    is_terminal_id, unique_outcome_name, Outcome, ABORTED, ABORTED_NAME, PREEMPTED,
    PREEMPTED_NAME, SUCCESS, SUCCESS_NAME,
};
pub use port::{DataPort, DataType, PortDirection};
pub use state::{State, StateKind, DEFAULT_OUTCOME_IDS, PATH_SEPARATOR};

pub(crate) use state::{Body, ExecutionBody, StateData};
pub(crate) use container::ContainerData;
