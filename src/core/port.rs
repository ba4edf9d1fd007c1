//! Typed data ports.

use super::ids::PortId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Declared type of a data port or scoped variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Any,
    Bool,
    Int,
    Float,
    String,
    List,
    Map,
}

impl DataType {
    /// Check whether `value` is acceptable for this type.
    ///
    /// `null` is accepted by every type and stands for "no value yet".
    /// Integers are accepted where floats are declared.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::Any, _) => true,
            (Self::Bool, Value::Bool(_)) => true,
            (Self::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Float, Value::Number(_)) => true,
            (Self::String, Value::String(_)) => true,
            (Self::List, Value::Array(_)) => true,
            (Self::Map, Value::Object(_)) => true,
            _ => false,
        }
    }

    /// Whether data of type `self` may flow into a port of type `target`.
    pub fn flows_into(&self, target: &DataType) -> bool {
        matches!(target, Self::Any)
            || matches!(self, Self::Any)
            || self == target
            || matches!((self, target), (Self::Int, Self::Float))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::List => "list",
            Self::Map => "map",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side of a state a port sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
    Scoped,
}

/// Typed, named slot on a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPort {
    pub id: PortId,
    pub name: String,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl DataPort {
    pub fn new(id: PortId, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn types_accept_matching_values() {
        assert!(DataType::Int.accepts(&json!(3)));
        assert!(DataType::Float.accepts(&json!(3)));
        assert!(DataType::Float.accepts(&json!(3.5)));
        assert!(DataType::String.accepts(&json!("x")));
        assert!(DataType::List.accepts(&json!([1, 2])));
        assert!(DataType::Map.accepts(&json!({"a": 1})));
        assert!(DataType::Any.accepts(&json!({"a": 1})));
    }

    #[test]
    fn types_reject_mismatches() {
        assert!(!DataType::Int.accepts(&json!(3.5)));
        assert!(!DataType::Int.accepts(&json!("3")));
        assert!(!DataType::Bool.accepts(&json!(1)));
        assert!(!DataType::Map.accepts(&json!([])));
    }

    #[test]
    fn null_is_accepted_everywhere() {
        for ty in [DataType::Bool, DataType::Int, DataType::String, DataType::Map] {
            assert!(ty.accepts(&Value::Null));
        }
    }

    #[test]
    fn int_flows_into_float_but_not_back() {
        assert!(DataType::Int.flows_into(&DataType::Float));
        assert!(!DataType::Float.flows_into(&DataType::Int));
        assert!(DataType::String.flows_into(&DataType::Any));
        assert!(!DataType::String.flows_into(&DataType::Bool));
    }

    #[test]
    fn port_serializes_without_absent_default() {
        let port = DataPort::new(4, "count", DataType::Int);
        let json = serde_json::to_value(&port).unwrap();
        assert_eq!(json, json!({"id": 4, "name": "count", "data_type": "int"}));
    }
}
