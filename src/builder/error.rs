//! Build errors for state builders.

use crate::core::StateError;
use thiserror::Error;

/// Errors that can occur when building a state tree.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BuildError {
    #[error("Execution state '{0}' has no script. Call .script(body) before .build()")]
    MissingScript(String),

    #[error("'{0}' is not a container; children, transitions and data flows need one")]
    NotAContainer(String),

    #[error("No child '{child}' in '{container}'")]
    UnknownChild { container: String, child: String },

    #[error("Name '{child}' matches more than one child of '{container}'; use its id")]
    AmbiguousChild { container: String, child: String },

    #[error("No port '{port}' on '{state}'")]
    UnknownPort { state: String, port: String },

    #[error("No outcome '{outcome}' on '{state}'")]
    UnknownOutcome { state: String, outcome: String },

    #[error(transparent)]
    State(#[from] StateError),
}
