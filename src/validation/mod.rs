//! Type checking of runtime data against declared ports.
//!
//! Checks accumulate *every* mismatch using Stillwater's `Validation`
//! instead of stopping at the first one, so a body author sees all wrong
//! inputs in a single report.
//!
//! # Example
//!
//! ```rust
//! use statecraft::core::{DataPort, DataType};
//! use statecraft::validation::check_data;
//! use serde_json::json;
//! use std::collections::BTreeMap;
//!
//! let ports = vec![
//!     DataPort::new(1, "count", DataType::Int),
//!     DataPort::new(2, "label", DataType::String),
//! ];
//! let mut data = BTreeMap::new();
//! data.insert("count".to_string(), json!("three"));
//! data.insert("label".to_string(), json!(4));
//!
//! let violations = check_data(&ports, &data).unwrap_err();
//! assert_eq!(violations.len(), 2);
//! ```

use crate::core::{DataPort, DataType};
use serde_json::Value;
use std::collections::BTreeMap;
use stillwater::validation::Validation;
use stillwater::NonEmptyVec;
use thiserror::Error;

/// A single value that does not match its port's declared type.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("port '{port}' expects {expected}, got {found}")]
pub struct TypeViolation {
    pub port: String,
    pub expected: DataType,
    pub found: String,
}

/// Accumulated result of a type check.
pub type TypeCheck = Validation<(), NonEmptyVec<TypeViolation>>;

/// Check one value against one port.
pub fn check_value(port: &DataPort, value: &Value) -> TypeCheck {
    if port.data_type.accepts(value) {
        Validation::success(())
    } else {
        Validation::fail(TypeViolation {
            port: port.name.clone(),
            expected: port.data_type,
            found: value.to_string(),
        })
    }
}

/// Validate every port that has a value in `data`, accumulating all
/// violations. Ports without a value are not checked.
pub fn validate_data<'a, I>(ports: I, data: &BTreeMap<String, Value>) -> TypeCheck
where
    I: IntoIterator<Item = &'a DataPort>,
{
    let checks: Vec<TypeCheck> = ports
        .into_iter()
        .filter_map(|port| data.get(&port.name).map(|value| check_value(port, value)))
        .collect();

    Validation::all_vec(checks).map(|_| ())
}

/// Like [`validate_data`] but flattened into a `Result`.
pub fn check_data<'a, I>(ports: I, data: &BTreeMap<String, Value>) -> Result<(), Vec<TypeViolation>>
where
    I: IntoIterator<Item = &'a DataPort>,
{
    match validate_data(ports, data) {
        Validation::Success(_) => Ok(()),
        Validation::Failure(errors) => Err(errors.iter().cloned().collect()),
    }
}
