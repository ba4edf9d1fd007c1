//! Errors raised by structural operations on the state tree.

use super::ids::{DataFlowId, OutcomeId, PortId, StateId, TransitionId};
use super::library::LibraryReference;
use crate::validation::TypeViolation;
use thiserror::Error;

/// Kind of element a [`StateError::NotFound`] refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    Port,
    Outcome,
    State,
    Transition,
    DataFlow,
    ScopedVariable,
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Port => "data port",
            Self::Outcome => "outcome",
            Self::State => "state",
            Self::Transition => "transition",
            Self::DataFlow => "data flow",
            Self::ScopedVariable => "scoped variable",
        };
        f.write_str(label)
    }
}

/// Errors from editing or constructing states.
///
/// Every operation returning one of these leaves the tree unchanged.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("Name must have at least one character")]
    EmptyName,

    #[error("State '{state}' already has a data port with id {id}")]
    DuplicatePort { state: StateId, id: PortId },

    #[error("State '{state}' already has an outcome with {what}")]
    DuplicateOutcome { state: StateId, what: String },

    #[error("Container '{container}' already has a child with id '{id}'")]
    DuplicateState { container: StateId, id: StateId },

    #[error("No {kind} '{id}' in state '{state}'")]
    NotFound {
        state: StateId,
        kind: ElementKind,
        id: String,
    },

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid data flow: {0}")]
    InvalidDataFlow(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(TypeViolation),

    #[error("Runtime data must be a mapping, got {0}")]
    MalformedData(String),

    #[error("State '{0}' is running; structural edits are not allowed")]
    StateActive(StateId),

    #[error("State '{0}' is not a container")]
    NotAContainer(StateId),

    #[error("State '{0}' already has a parent")]
    AlreadyParented(StateId),

    #[error("Library '{0}' could not be resolved")]
    LibraryNotFound(LibraryReference),
}

impl StateError {
    pub(crate) fn not_found(state: &str, kind: ElementKind, id: impl ToString) -> Self {
        Self::NotFound {
            state: state.to_string(),
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn port_not_found(state: &str, id: PortId) -> Self {
        Self::not_found(state, ElementKind::Port, id)
    }

    pub(crate) fn outcome_not_found(state: &str, id: OutcomeId) -> Self {
        Self::not_found(state, ElementKind::Outcome, id)
    }

    pub(crate) fn transition_not_found(state: &str, id: TransitionId) -> Self {
        Self::not_found(state, ElementKind::Transition, id)
    }

    pub(crate) fn data_flow_not_found(state: &str, id: DataFlowId) -> Self {
        Self::not_found(state, ElementKind::DataFlow, id)
    }
}
