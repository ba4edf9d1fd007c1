//! Document error types.

use crate::core::{StateError, StateId};
use thiserror::Error;

/// Errors that can occur when encoding or decoding state documents.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// Serialization to JSON failed
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Deserialization from JSON failed
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Document version is not supported by this version
    #[error("Unsupported document version {found}, supported: {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Execution state '{0}' has no script key")]
    MissingScriptKey(StateId),

    #[error("No script registered under '{0}'")]
    UnknownScript(String),

    /// The described tree breaks a structural rule
    #[error("Invalid document: {0}")]
    Invalid(#[from] StateError),
}
