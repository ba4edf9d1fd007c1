//! Builder for constructing state trees.

use crate::builder::error::BuildError;
use crate::core::{
    DataType, IdAllocator, LibraryReference, LibraryResolver, OutcomeId, PortDirection, State,
    StateId, StateKind,
};
use crate::execution::Script;
use serde_json::Value;
use std::sync::Arc;

/// Endpoint name referring to the container being built.
pub const SELF: &str = ".";

struct PortSpec {
    name: String,
    data_type: DataType,
    default: Option<Value>,
}

enum Pending {
    Builder(StateBuilder),
    Built(Arc<State>),
}

enum TransitionSpec {
    ToChild {
        from: String,
        outcome: String,
        to: String,
    },
    Exit {
        from: String,
        outcome: String,
        container_outcome: String,
    },
}

struct FlowSpec {
    from: String,
    from_port: String,
    to: String,
    to_port: String,
}

/// Fluent builder for a [`State`] and everything below it.
///
/// Children, outcomes and ports are referred to by name; a child may also
/// be referred to by id. [`SELF`] names the container itself in data flows.
///
/// # Example
///
/// ```rust
/// use statecraft::builder::{StateBuilder, SELF};
/// use statecraft::core::{DataType, IdAllocator};
/// use statecraft::execution::EmptyScript;
/// use std::sync::Arc;
///
/// let ids = IdAllocator::new();
/// let root = StateBuilder::hierarchy("root")
///     .input("n", DataType::Int, None)
///     .child(
///         StateBuilder::execution("A", Arc::new(EmptyScript))
///             .input("x", DataType::Int, None),
///     )
///     .child(StateBuilder::execution("B", Arc::new(EmptyScript)))
///     .transition("A", "success", "B")
///     .exit("B", "success", "success")
///     .data_flow(SELF, "n", "A", "x")
///     .build(&ids)
///     .unwrap();
///
/// assert_eq!(root.children().len(), 2);
/// assert_eq!(root.transitions().len(), 2);
/// ```
pub struct StateBuilder {
    kind: StateKind,
    name: String,
    id: Option<StateId>,
    description: Option<String>,
    script: Option<Arc<dyn Script>>,
    script_key: Option<String>,
    library: Option<(LibraryReference, Arc<dyn LibraryResolver>)>,
    inputs: Vec<PortSpec>,
    outputs: Vec<PortSpec>,
    scoped: Vec<PortSpec>,
    outcomes: Vec<(String, Option<OutcomeId>)>,
    children: Vec<Pending>,
    start: Option<String>,
    transitions: Vec<TransitionSpec>,
    flows: Vec<FlowSpec>,
}

impl StateBuilder {
    fn new(kind: StateKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            id: None,
            description: None,
            script: None,
            script_key: None,
            library: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            scoped: Vec::new(),
            outcomes: Vec::new(),
            children: Vec::new(),
            start: None,
            transitions: Vec::new(),
            flows: Vec::new(),
        }
    }

    pub fn execution(name: impl Into<String>, script: Arc<dyn Script>) -> Self {
        let mut builder = Self::new(StateKind::Execution, name);
        builder.script = Some(script);
        builder
    }

    pub fn hierarchy(name: impl Into<String>) -> Self {
        Self::new(StateKind::Hierarchy, name)
    }

    pub fn preemptive_concurrency(name: impl Into<String>) -> Self {
        Self::new(StateKind::PreemptiveConcurrency, name)
    }

    pub fn barrier_concurrency(name: impl Into<String>) -> Self {
        Self::new(StateKind::BarrierConcurrency, name)
    }

    pub fn library(
        name: impl Into<String>,
        reference: LibraryReference,
        resolver: Arc<dyn LibraryResolver>,
    ) -> Self {
        let mut builder = Self::new(StateKind::Library, name);
        builder.library = Some((reference, resolver));
        builder
    }

    /// Use a fixed id instead of drawing one.
    pub fn id(mut self, id: impl Into<StateId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Replace the script of an execution state.
    pub fn script(mut self, script: Arc<dyn Script>) -> Self {
        self.script = Some(script);
        self
    }

    /// Key under which the script is found in a script registry.
    pub fn script_key(mut self, key: impl Into<String>) -> Self {
        self.script_key = Some(key.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>, data_type: DataType, default: Option<Value>) -> Self {
        self.inputs.push(PortSpec {
            name: name.into(),
            data_type,
            default,
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>, data_type: DataType, default: Option<Value>) -> Self {
        self.outputs.push(PortSpec {
            name: name.into(),
            data_type,
            default,
        });
        self
    }

    pub fn scoped_variable(
        mut self,
        name: impl Into<String>,
        data_type: DataType,
        default: Option<Value>,
    ) -> Self {
        self.scoped.push(PortSpec {
            name: name.into(),
            data_type,
            default,
        });
        self
    }

    /// Add an outcome with an allocated id.
    pub fn outcome(mut self, name: impl Into<String>) -> Self {
        self.outcomes.push((name.into(), None));
        self
    }

    pub fn outcome_with_id(mut self, name: impl Into<String>, id: OutcomeId) -> Self {
        self.outcomes.push((name.into(), Some(id)));
        self
    }

    /// Add a child built from another builder.
    pub fn child(mut self, child: StateBuilder) -> Self {
        self.children.push(Pending::Builder(child));
        self
    }

    /// Add an already constructed root state as a child.
    pub fn add_child(mut self, child: Arc<State>) -> Self {
        self.children.push(Pending::Built(child));
        self
    }

    /// Start with this child instead of the first one added.
    pub fn start(mut self, child: impl Into<String>) -> Self {
        self.start = Some(child.into());
        self
    }

    /// Continue with child `to` when child `from` finishes with `outcome`.
    pub fn transition(
        mut self,
        from: impl Into<String>,
        outcome: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.transitions.push(TransitionSpec::ToChild {
            from: from.into(),
            outcome: outcome.into(),
            to: to.into(),
        });
        self
    }

    /// Finish the container with `container_outcome` when child `from`
    /// finishes with `outcome`.
    pub fn exit(
        mut self,
        from: impl Into<String>,
        outcome: impl Into<String>,
        container_outcome: impl Into<String>,
    ) -> Self {
        self.transitions.push(TransitionSpec::Exit {
            from: from.into(),
            outcome: outcome.into(),
            container_outcome: container_outcome.into(),
        });
        self
    }

    pub fn data_flow(
        mut self,
        from: impl Into<String>,
        from_port: impl Into<String>,
        to: impl Into<String>,
        to_port: impl Into<String>,
    ) -> Self {
        self.flows.push(FlowSpec {
            from: from.into(),
            from_port: from_port.into(),
            to: to.into(),
            to_port: to_port.into(),
        });
        self
    }

    /// Build the state and its children, drawing ids from `ids`.
    pub fn build(self, ids: &IdAllocator) -> Result<Arc<State>, BuildError> {
        let has_structure = !self.children.is_empty()
            || !self.transitions.is_empty()
            || !self.flows.is_empty()
            || !self.scoped.is_empty()
            || self.start.is_some();
        if has_structure && !self.kind.is_container() {
            return Err(BuildError::NotAContainer(self.name));
        }

        let state = match self.kind {
            StateKind::Execution => {
                let script = self
                    .script
                    .ok_or_else(|| BuildError::MissingScript(self.name.clone()))?;
                let state = State::construct_execution(self.id, self.name, script, ids)?;
                state.set_script_key(self.script_key);
                state
            }
            StateKind::Library => {
                let Some((reference, resolver)) = self.library else {
                    return Err(BuildError::NotAContainer(self.name));
                };
                State::library_with_id(self.id, self.name, reference, resolver.as_ref(), ids)?
            }
            kind => State::construct_container(kind, self.id, self.name, ids)?,
        };

        if let Some(description) = self.description {
            state.set_description(description)?;
        }
        for port in self.inputs {
            state.add_input_port(port.name, port.data_type, port.default, None)?;
        }
        for port in self.outputs {
            state.add_output_port(port.name, port.data_type, port.default, None)?;
        }
        for port in self.scoped {
            state.add_scoped_variable(port.name, port.data_type, port.default, None)?;
        }
        for (name, id) in self.outcomes {
            state.add_outcome(name, id)?;
        }
        for child in self.children {
            let child = match child {
                Pending::Builder(builder) => builder.build(ids)?,
                Pending::Built(state) => state,
            };
            state.add_state(child)?;
        }
        if let Some(start) = self.start {
            let child = resolve_child(&state, &start)?;
            state.set_start_state(&child.id())?;
        }
        for transition in self.transitions {
            add_transition(&state, transition)?;
        }
        for flow in self.flows {
            add_flow(&state, flow)?;
        }
        Ok(state)
    }
}

fn resolve_child(container: &State, key: &str) -> Result<Arc<State>, BuildError> {
    if let Some(child) = container.child(key) {
        return Ok(child);
    }
    let mut matches = container.children().into_iter().filter(|c| c.name() == key);
    match (matches.next(), matches.next()) {
        (Some(child), None) => Ok(child),
        (Some(_), Some(_)) => Err(BuildError::AmbiguousChild {
            container: container.name(),
            child: key.to_string(),
        }),
        (None, _) => Err(BuildError::UnknownChild {
            container: container.name(),
            child: key.to_string(),
        }),
    }
}

fn outcome_id(state: &State, name: &str) -> Result<OutcomeId, BuildError> {
    state
        .outcomes()
        .into_values()
        .find(|o| o.name == name)
        .map(|o| o.id)
        .ok_or_else(|| BuildError::UnknownOutcome {
            state: state.name(),
            outcome: name.to_string(),
        })
}

fn add_transition(container: &State, spec: TransitionSpec) -> Result<(), BuildError> {
    match spec {
        TransitionSpec::ToChild { from, outcome, to } => {
            let source = resolve_child(container, &from)?;
            let target = resolve_child(container, &to)?;
            let outcome = outcome_id(&source, &outcome)?;
            container.add_transition(&source.id(), outcome, &target.id(), None)?;
        }
        TransitionSpec::Exit {
            from,
            outcome,
            container_outcome,
        } => {
            let source = resolve_child(container, &from)?;
            let outcome = outcome_id(&source, &outcome)?;
            let target = outcome_id(container, &container_outcome)?;
            container.add_transition(&source.id(), outcome, &container.id(), Some(target))?;
        }
    }
    Ok(())
}

fn add_flow(container: &State, spec: FlowSpec) -> Result<(), BuildError> {
    let unknown_port = |state: &State, port: &str| BuildError::UnknownPort {
        state: state.name(),
        port: port.to_string(),
    };

    let (from_id, from_port) = if spec.from == SELF {
        let port = container
            .port_by_name(&spec.from_port, PortDirection::Input)
            .or_else(|| container.port_by_name(&spec.from_port, PortDirection::Scoped))
            .ok_or_else(|| unknown_port(container, &spec.from_port))?;
        (container.id(), port.id)
    } else {
        let child = resolve_child(container, &spec.from)?;
        let port = child
            .port_by_name(&spec.from_port, PortDirection::Output)
            .ok_or_else(|| unknown_port(&child, &spec.from_port))?;
        (child.id(), port.id)
    };

    let (to_id, to_port) = if spec.to == SELF {
        let port = container
            .port_by_name(&spec.to_port, PortDirection::Output)
            .or_else(|| container.port_by_name(&spec.to_port, PortDirection::Scoped))
            .ok_or_else(|| unknown_port(container, &spec.to_port))?;
        (container.id(), port.id)
    } else {
        let child = resolve_child(container, &spec.to)?;
        let port = child
            .port_by_name(&spec.to_port, PortDirection::Input)
            .ok_or_else(|| unknown_port(&child, &spec.to_port))?;
        (child.id(), port.id)
    };

    container.add_data_flow(&from_id, from_port, &to_id, to_port)?;
    Ok(())
}
