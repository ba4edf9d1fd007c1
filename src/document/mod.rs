//! Serializable description of a state tree.
//!
//! A [`StateDocument`] captures the structure of a tree: ids, names, ports,
//! outcomes, children and their wiring. Script bodies are not serializable;
//! execution states carry a script key that is looked up in a
//! [`ScriptRegistry`] when decoding. Library states carry their reference
//! and are resolved again on decode.
//!
//! # Example
//!
//! ```rust
//! use statecraft::builder::StateBuilder;
//! use statecraft::core::{IdAllocator, InMemoryLibrary};
//! use statecraft::document::{decode, encode, DecodeContext, ScriptRegistry};
//! use statecraft::execution::EmptyScript;
//! use std::sync::Arc;
//!
//! let ids = IdAllocator::new();
//! let root = StateBuilder::hierarchy("root")
//!     .child(StateBuilder::execution("A", Arc::new(EmptyScript)).script_key("noop"))
//!     .build(&ids)
//!     .unwrap();
//!
//! let json = encode(&root).to_json().unwrap();
//!
//! let scripts = ScriptRegistry::new().with("noop", Arc::new(EmptyScript));
//! let library = InMemoryLibrary::new();
//! let ctx = DecodeContext::new(IdAllocator::new(), &scripts, &library);
//! let restored = decode(&statecraft::document::StateDocument::from_json(&json).unwrap(), &ctx).unwrap();
//!
//! assert_eq!(restored.id(), root.id());
//! assert_eq!(restored.children().len(), 1);
//! ```

use crate::core::{
    Body, ContainerData, DataFlow, DataPort, ExecutionBody, IdAllocator, LibraryReference,
    LibraryResolver, Outcome, OutcomeId, PortId, State, StateData, StateError, StateId,
    StateKind, Transition, ABORTED, PREEMPTED,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub mod error;
mod registry;

pub use error::DocumentError;
pub use registry::ScriptRegistry;

/// Version identifier for the document format
pub const DOCUMENT_VERSION: u32 = 1;

/// Serializable snapshot of a state tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// Document format version
    pub version: u32,

    /// Unique document identifier
    pub id: String,

    /// When the document was created
    pub created_at: DateTime<Utc>,

    pub root: StateNode,
}

/// One state of a [`StateDocument`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateNode {
    pub id: StateId,
    pub kind: StateKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_ports: Vec<DataPort>,
    #[serde(default)]
    pub output_ports: Vec<DataPort>,
    pub outcomes: Vec<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<LibraryReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StateNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_state: Option<StateId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_flows: Vec<DataFlow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scoped_variables: Vec<DataPort>,
}

impl StateDocument {
    pub fn to_json(&self) -> Result<String, DocumentError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DocumentError::SerializationFailed(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        serde_json::from_str(json).map_err(|e| DocumentError::DeserializationFailed(e.to_string()))
    }
}

/// What decoding needs from the host.
pub struct DecodeContext<'a> {
    pub allocator: IdAllocator,
    pub scripts: &'a ScriptRegistry,
    pub resolver: &'a dyn LibraryResolver,
}

impl<'a> DecodeContext<'a> {
    pub fn new(
        allocator: IdAllocator,
        scripts: &'a ScriptRegistry,
        resolver: &'a dyn LibraryResolver,
    ) -> Self {
        Self {
            allocator,
            scripts,
            resolver,
        }
    }
}

/// Describe `state` and everything below it.
pub fn encode(state: &State) -> StateDocument {
    StateDocument {
        version: DOCUMENT_VERSION,
        id: Uuid::new_v4().to_string(),
        created_at: Utc::now(),
        root: encode_node(state),
    }
}

fn encode_node(state: &State) -> StateNode {
    let data = state.data.read();
    let mut node = StateNode {
        id: data.id.clone(),
        kind: state.kind(),
        name: data.name.clone(),
        description: data.description.clone(),
        input_ports: data.input_ports.values().cloned().collect(),
        output_ports: data.output_ports.values().cloned().collect(),
        outcomes: data.outcomes.values().cloned().collect(),
        script_key: None,
        library: None,
        children: Vec::new(),
        start_state: None,
        transitions: Vec::new(),
        data_flows: Vec::new(),
        scoped_variables: Vec::new(),
    };
    match &data.body {
        Body::Execution(body) => node.script_key = body.script_key.clone(),
        Body::Container(container) => {
            node.children = container.children.values().map(|c| encode_node(c)).collect();
            node.start_state = container.start_child_id.clone();
            node.transitions = container.transitions.values().cloned().collect();
            node.data_flows = container.data_flows.values().cloned().collect();
            node.scoped_variables = container.scoped_variables.values().cloned().collect();
        }
        Body::Library(library) => node.library = Some(library.reference.clone()),
    }
    node
}

/// Rebuild a tree from `document`.
pub fn decode(document: &StateDocument, ctx: &DecodeContext<'_>) -> Result<Arc<State>, DocumentError> {
    if document.version != DOCUMENT_VERSION {
        return Err(DocumentError::UnsupportedVersion {
            found: document.version,
            supported: DOCUMENT_VERSION,
        });
    }
    let state = decode_node(&document.root, ctx)?;
    debug!(document = %document.id, root = %state.id(), "state document decoded");
    Ok(state)
}

fn decode_node(node: &StateNode, ctx: &DecodeContext<'_>) -> Result<Arc<State>, DocumentError> {
    if node.name.is_empty() || node.id.is_empty() {
        return Err(StateError::EmptyName.into());
    }

    if node.kind == StateKind::Library {
        let reference = node.library.clone().ok_or_else(|| {
            StateError::InvariantViolation(format!("library state '{}' has no reference", node.id))
        })?;
        let state = State::library_with_id(
            Some(node.id.clone()),
            node.name.clone(),
            reference,
            ctx.resolver,
            &ctx.allocator,
        )?;
        if let Some(description) = &node.description {
            state.set_description(description.clone())?;
        }
        return Ok(state);
    }

    let mut seen_ports = HashSet::new();
    let body = match node.kind {
        StateKind::Execution => {
            let key = node
                .script_key
                .clone()
                .ok_or_else(|| DocumentError::MissingScriptKey(node.id.clone()))?;
            let script = ctx
                .scripts
                .get(&key)
                .ok_or_else(|| DocumentError::UnknownScript(key.clone()))?;
            Body::Execution(ExecutionBody {
                script,
                script_key: Some(key),
            })
        }
        _ => Body::Container(ContainerData {
            scoped_variables: port_map(&node.id, &node.scoped_variables, &mut seen_ports)?,
            ..ContainerData::default()
        }),
    };

    let mut data = StateData::new(node.id.clone(), node.name.clone(), body);
    data.description = node.description.clone();
    data.input_ports = port_map(&node.id, &node.input_ports, &mut seen_ports)?;
    data.output_ports = port_map(&node.id, &node.output_ports, &mut seen_ports)?;
    data.outcomes = outcome_map(&node.id, &node.outcomes)?;
    let state = State::from_parts(node.kind, data, ctx.allocator.clone());

    if node.kind.is_container() {
        for child in &node.children {
            state.add_state(decode_node(child, ctx)?)?;
        }
        state.restore_start_state(node.start_state.as_deref())?;
        for transition in &node.transitions {
            state.insert_transition(transition)?;
        }
        for flow in &node.data_flows {
            state.insert_data_flow(flow)?;
        }
    }
    Ok(state)
}

fn port_map(
    state: &str,
    ports: &[DataPort],
    seen: &mut HashSet<PortId>,
) -> Result<BTreeMap<PortId, DataPort>, StateError> {
    ports
        .iter()
        .map(|port| {
            if !seen.insert(port.id) {
                return Err(StateError::DuplicatePort {
                    state: state.to_string(),
                    id: port.id,
                });
            }
            Ok((port.id, port.clone()))
        })
        .collect()
}

fn outcome_map(state: &str, outcomes: &[Outcome]) -> Result<BTreeMap<OutcomeId, Outcome>, StateError> {
    let mut map = BTreeMap::new();
    for outcome in outcomes {
        if map.values().any(|o: &Outcome| o.name == outcome.name) || map.contains_key(&outcome.id) {
            return Err(StateError::DuplicateOutcome {
                state: state.to_string(),
                what: format!("{outcome}"),
            });
        }
        map.insert(outcome.id, outcome.clone());
    }
    for required in [ABORTED, PREEMPTED] {
        if !map.contains_key(&required) {
            return Err(StateError::InvariantViolation(format!(
                "state '{state}' lacks outcome {required}"
            )));
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{StateBuilder, SELF};
    use crate::core::{DataType, InMemoryLibrary, SUCCESS};
    use crate::execution::{EmptyScript, Script};

    fn noop() -> Arc<dyn Script> {
        Arc::new(EmptyScript)
    }

    fn sample(ids: &IdAllocator) -> Arc<State> {
        StateBuilder::hierarchy("root")
            .description("sample tree")
            .input("n", DataType::Int, None)
            .output("result", DataType::Int, None)
            .scoped_variable("seen", DataType::Int, Some(serde_json::json!(0)))
            .child(
                StateBuilder::execution("A", noop())
                    .script_key("noop")
                    .input("x", DataType::Int, None)
                    .output("y", DataType::Int, None)
                    .outcome("retry"),
            )
            .child(StateBuilder::execution("B", noop()).script_key("noop"))
            .transition("A", "success", "B")
            .exit("B", "success", "success")
            .data_flow(SELF, "n", "A", "x")
            .data_flow("A", "y", SELF, "result")
            .build(ids)
            .unwrap()
    }

    #[test]
    fn decoded_tree_matches_original() {
        let ids = IdAllocator::sequential();
        let root = sample(&ids);
        let document = encode(&root);

        let scripts = ScriptRegistry::new().with("noop", noop());
        let library = InMemoryLibrary::new();
        let ctx = DecodeContext::new(IdAllocator::sequential(), &scripts, &library);
        let restored = decode(&document, &ctx).unwrap();

        assert_eq!(encode(&restored).root, document.root);
        assert_eq!(restored.description().as_deref(), Some("sample tree"));
        let a = restored.child(&root.start_state_id().unwrap()).unwrap();
        assert_eq!(a.script_key().as_deref(), Some("noop"));
        assert!(Arc::ptr_eq(&a.parent().unwrap(), &restored));
    }

    #[test]
    fn json_round_trip_preserves_document() {
        let ids = IdAllocator::sequential();
        let document = encode(&sample(&ids));
        let json = document.to_json().unwrap();
        assert_eq!(StateDocument::from_json(&json).unwrap(), document);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let ids = IdAllocator::sequential();
        let mut document = encode(&sample(&ids));
        document.version = DOCUMENT_VERSION + 1;

        let scripts = ScriptRegistry::new();
        let library = InMemoryLibrary::new();
        let ctx = DecodeContext::new(IdAllocator::sequential(), &scripts, &library);
        assert!(matches!(
            decode(&document, &ctx),
            Err(DocumentError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn unknown_script_key_is_reported() {
        let ids = IdAllocator::sequential();
        let document = encode(&sample(&ids));
        let scripts = ScriptRegistry::new();
        let library = InMemoryLibrary::new();
        let ctx = DecodeContext::new(IdAllocator::sequential(), &scripts, &library);
        assert!(matches!(
            decode(&document, &ctx),
            Err(DocumentError::UnknownScript(key)) if key == "noop"
        ));
    }

    #[test]
    fn dangling_transition_is_invalid() {
        let ids = IdAllocator::sequential();
        let mut document = encode(&sample(&ids));
        document.root.transitions[0].to_state = "nowhere".into();

        let scripts = ScriptRegistry::new().with("noop", noop());
        let library = InMemoryLibrary::new();
        let ctx = DecodeContext::new(IdAllocator::sequential(), &scripts, &library);
        assert!(matches!(
            decode(&document, &ctx),
            Err(DocumentError::Invalid(StateError::InvalidTransition(_)))
        ));
    }

    #[test]
    fn missing_terminal_outcome_is_invalid() {
        let ids = IdAllocator::sequential();
        let mut document = encode(&sample(&ids));
        document.root.outcomes.retain(|o| o.id != PREEMPTED);

        let scripts = ScriptRegistry::new().with("noop", noop());
        let library = InMemoryLibrary::new();
        let ctx = DecodeContext::new(IdAllocator::sequential(), &scripts, &library);
        assert!(matches!(
            decode(&document, &ctx),
            Err(DocumentError::Invalid(StateError::InvariantViolation(_)))
        ));
    }

    #[test]
    fn library_states_are_resolved_again() {
        let ids = IdAllocator::sequential();
        let library = Arc::new(InMemoryLibrary::new());
        let reference = LibraryReference::new("generic", "noop", "1");
        library.register(
            reference.clone(),
            StateBuilder::execution("noop", noop())
                .script_key("noop")
                .build(&ids)
                .unwrap(),
        );
        let state = StateBuilder::library("lib", reference.clone(), library.clone())
            .build(&ids)
            .unwrap();
        let document = encode(&state);
        assert_eq!(document.root.library, Some(reference));

        let scripts = ScriptRegistry::new();
        let ctx = DecodeContext::new(IdAllocator::sequential(), &scripts, library.as_ref());
        let restored = decode(&document, &ctx).unwrap();
        assert_eq!(restored.id(), state.id());
        assert!(restored.outcome(SUCCESS).is_some());

        let empty = InMemoryLibrary::new();
        let ctx = DecodeContext::new(IdAllocator::sequential(), &scripts, &empty);
        assert!(matches!(
            decode(&document, &ctx),
            Err(DocumentError::Invalid(StateError::LibraryNotFound(_)))
        ));
    }
}
