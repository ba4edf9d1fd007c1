//! Children, transitions, data flows and scoped variables of composite
//! states.

use super::error::{ElementKind, StateError};
use super::events::StateChange;
use super::ids::{DataFlowId, OutcomeId, PortId, StateId, TransitionId};
use super::port::{DataPort, DataType, PortDirection};
use super::state::{Body, State, StateKind, PATH_SEPARATOR};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Edge from a child's outcome to a sibling, or to an outcome of the
/// container itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub from_state: StateId,
    pub from_outcome: OutcomeId,
    pub to_state: StateId,
    /// Container outcome to finish with when `to_state` is the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_outcome: Option<OutcomeId>,
}

/// Edge carrying a value from one port to another inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFlow {
    pub id: DataFlowId,
    pub from_state: StateId,
    pub from_port: PortId,
    pub to_state: StateId,
    pub to_port: PortId,
}

impl DataFlow {
    /// Whether either end of the flow is `port` on `state`.
    pub fn touches(&self, state: &str, port: PortId) -> bool {
        (self.from_state == state && self.from_port == port)
            || (self.to_state == state && self.to_port == port)
    }
}

#[derive(Default)]
pub(crate) struct ContainerData {
    pub(crate) children: BTreeMap<StateId, Arc<State>>,
    pub(crate) start_child_id: Option<StateId>,
    pub(crate) transitions: BTreeMap<TransitionId, Transition>,
    pub(crate) data_flows: BTreeMap<DataFlowId, DataFlow>,
    pub(crate) scoped_variables: BTreeMap<PortId, DataPort>,
}

impl ContainerData {
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            children: self
                .children
                .iter()
                .map(|(id, child)| (id.clone(), child.duplicate()))
                .collect(),
            start_child_id: self.start_child_id.clone(),
            transitions: self.transitions.clone(),
            data_flows: self.data_flows.clone(),
            scoped_variables: self.scoped_variables.clone(),
        }
    }

    /// Rewrite every reference to state `old` so it names `new`.
    pub(crate) fn rename_references(&mut self, old: &str, new: &str) {
        if self.start_child_id.as_deref() == Some(old) {
            self.start_child_id = Some(new.to_string());
        }
        for transition in self.transitions.values_mut() {
            if transition.from_state == old {
                transition.from_state = new.to_string();
            }
            if transition.to_state == old {
                transition.to_state = new.to_string();
            }
        }
        for flow in self.data_flows.values_mut() {
            if flow.from_state == old {
                flow.from_state = new.to_string();
            }
            if flow.to_state == old {
                flow.to_state = new.to_string();
            }
        }
    }

    pub(crate) fn remove_flows_touching(&mut self, state: &str, port: PortId) -> Vec<DataFlowId> {
        let ids: Vec<DataFlowId> = self
            .data_flows
            .values()
            .filter(|f| f.touches(state, port))
            .map(|f| f.id)
            .collect();
        for id in &ids {
            self.data_flows.remove(id);
        }
        ids
    }

    pub(crate) fn remove_transition_from(
        &mut self,
        state: &str,
        outcome: OutcomeId,
    ) -> Option<TransitionId> {
        let id = self.transition_from(state, outcome)?.id;
        self.transitions.remove(&id);
        Some(id)
    }

    /// Drop transitions that end the container with `outcome`.
    pub(crate) fn remove_transitions_into_self(
        &mut self,
        container: &str,
        outcome: OutcomeId,
    ) -> Vec<TransitionId> {
        let ids: Vec<TransitionId> = self
            .transitions
            .values()
            .filter(|t| t.to_state == container && t.to_outcome == Some(outcome))
            .map(|t| t.id)
            .collect();
        for id in &ids {
            self.transitions.remove(id);
        }
        ids
    }

    pub(crate) fn transition_from(&self, state: &str, outcome: OutcomeId) -> Option<&Transition> {
        self.transitions
            .values()
            .find(|t| t.from_state == state && t.from_outcome == outcome)
    }

    fn remove_state_references(&mut self, id: &str) -> (Vec<TransitionId>, Vec<DataFlowId>) {
        let transitions: Vec<TransitionId> = self
            .transitions
            .values()
            .filter(|t| t.from_state == id || t.to_state == id)
            .map(|t| t.id)
            .collect();
        for t in &transitions {
            self.transitions.remove(t);
        }
        let flows: Vec<DataFlowId> = self
            .data_flows
            .values()
            .filter(|f| f.from_state == id || f.to_state == id)
            .map(|f| f.id)
            .collect();
        for f in &flows {
            self.data_flows.remove(f);
        }
        (transitions, flows)
    }
}

impl State {
    fn not_a_container(&self) -> StateError {
        StateError::NotAContainer(self.id())
    }

    /// Add `child` to this container. The first child of a hierarchy becomes
    /// its start state.
    pub fn add_state(&self, child: Arc<State>) -> Result<StateId, StateError> {
        self.ensure_idle()?;
        if child.parent().is_some() {
            return Err(StateError::AlreadyParented(child.id()));
        }
        let child_id = child.id();
        let start_changed = {
            let mut data = self.data.write();
            let container_id = data.id.clone();
            let kind = self.kind();
            let Some(container) = data.container_mut() else {
                return Err(StateError::NotAContainer(container_id));
            };
            if child_id == container_id || container.children.contains_key(&child_id) {
                return Err(StateError::DuplicateState {
                    container: container_id,
                    id: child_id,
                });
            }
            container.children.insert(child_id.clone(), Arc::clone(&child));
            if kind == StateKind::Hierarchy && container.start_child_id.is_none() {
                container.start_child_id = Some(child_id.clone());
                true
            } else {
                false
            }
        };
        child.set_parent(self.weak());

        debug!(container = %self.id(), child = %child_id, "child state added");
        self.notify(StateChange::ChildAdded {
            id: child_id.clone(),
        });
        if start_changed {
            self.notify(StateChange::StartStateChanged {
                id: Some(child_id.clone()),
            });
        }
        Ok(child_id)
    }

    /// Remove a child together with every transition and data flow that
    /// references it. The removed child becomes a root.
    pub fn remove_state(&self, id: &str) -> Result<Arc<State>, StateError> {
        self.ensure_idle()?;
        let (child, transitions, flows, start_cleared) = {
            let mut data = self.data.write();
            let container_id = data.id.clone();
            let Some(container) = data.container_mut() else {
                return Err(StateError::NotAContainer(container_id));
            };
            let Some(child) = container.children.remove(id) else {
                return Err(StateError::not_found(&container_id, ElementKind::State, id));
            };
            let (transitions, flows) = container.remove_state_references(id);
            let start_cleared = container.start_child_id.as_deref() == Some(id);
            if start_cleared {
                container.start_child_id = None;
            }
            (child, transitions, flows, start_cleared)
        };
        child.set_parent(std::sync::Weak::new());

        for transition_id in transitions {
            self.notify(StateChange::TransitionRemoved { id: transition_id });
        }
        for flow_id in flows {
            self.notify(StateChange::DataFlowRemoved { id: flow_id });
        }
        if start_cleared {
            self.notify(StateChange::StartStateChanged { id: None });
        }
        debug!(container = %self.id(), child = %id, "child state removed");
        self.notify(StateChange::ChildRemoved { id: id.to_string() });
        Ok(child)
    }

    /// Make child `id` the first state a hierarchy runs.
    pub fn set_start_state(&self, id: &str) -> Result<(), StateError> {
        self.ensure_idle()?;
        {
            let mut data = self.data.write();
            let container_id = data.id.clone();
            let Some(container) = data.container_mut() else {
                return Err(StateError::NotAContainer(container_id));
            };
            if !container.children.contains_key(id) {
                return Err(StateError::not_found(&container_id, ElementKind::State, id));
            }
            container.start_child_id = Some(id.to_string());
        }
        self.notify(StateChange::StartStateChanged {
            id: Some(id.to_string()),
        });
        Ok(())
    }

    /// Set or clear the start child without touching anything else.
    pub(crate) fn restore_start_state(&self, id: Option<&str>) -> Result<(), StateError> {
        match id {
            Some(id) => self.set_start_state(id),
            None => {
                if let Some(container) = self.data.write().container_mut() {
                    container.start_child_id = None;
                }
                Ok(())
            }
        }
    }

    /// Id of the start child, once one is set.
    pub fn start_state_id(&self) -> Option<StateId> {
        self.data.read().container()?.start_child_id.clone()
    }

    /// Direct child by id.
    pub fn child(&self, id: &str) -> Option<Arc<State>> {
        self.data.read().container()?.children.get(id).cloned()
    }

    /// Children ordered by id.
    pub fn children(&self) -> Vec<Arc<State>> {
        self.data
            .read()
            .container()
            .map(|c| c.children.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Transitions by id. Empty for non-containers.
    pub fn transitions(&self) -> BTreeMap<TransitionId, Transition> {
        self.data
            .read()
            .container()
            .map(|c| c.transitions.clone())
            .unwrap_or_default()
    }

    /// Data flows by id. Empty for non-containers.
    pub fn data_flows(&self) -> BTreeMap<DataFlowId, DataFlow> {
        self.data
            .read()
            .container()
            .map(|c| c.data_flows.clone())
            .unwrap_or_default()
    }

    /// Scoped variables by port id.
    pub fn scoped_variables(&self) -> BTreeMap<PortId, DataPort> {
        self.data
            .read()
            .container()
            .map(|c| c.scoped_variables.clone())
            .unwrap_or_default()
    }

    /// The transition leaving `state` through `outcome`, if any.
    pub fn transition_from(&self, state: &str, outcome: OutcomeId) -> Option<Transition> {
        self.data
            .read()
            .container()?
            .transition_from(state, outcome)
            .cloned()
    }

    /// Connect a child's outcome to a sibling or to an outcome of this
    /// container.
    ///
    /// Concurrency containers only accept transitions that end the container.
    /// A child outcome may have at most one transition.
    pub fn add_transition(
        &self,
        from_state: &str,
        from_outcome: OutcomeId,
        to_state: &str,
        to_outcome: Option<OutcomeId>,
    ) -> Result<TransitionId, StateError> {
        self.put_transition(None, from_state, from_outcome, to_state, to_outcome)
    }

    /// Add a transition keeping its id.
    pub(crate) fn insert_transition(&self, transition: &Transition) -> Result<TransitionId, StateError> {
        self.put_transition(
            Some(transition.id),
            &transition.from_state,
            transition.from_outcome,
            &transition.to_state,
            transition.to_outcome,
        )
    }

    fn put_transition(
        &self,
        id: Option<TransitionId>,
        from_state: &str,
        from_outcome: OutcomeId,
        to_state: &str,
        to_outcome: Option<OutcomeId>,
    ) -> Result<TransitionId, StateError> {
        self.ensure_idle()?;
        let kind = self.kind();
        let transition_id = {
            let mut data = self.data.write();
            let container_id = data.id.clone();
            let outcome_known = to_outcome.is_some_and(|o| data.outcomes.contains_key(&o));
            let Some(container) = data.container_mut() else {
                return Err(StateError::NotAContainer(container_id));
            };

            let Some(source) = container.children.get(from_state) else {
                return Err(StateError::InvalidTransition(format!(
                    "'{from_state}' is not a child of '{container_id}'"
                )));
            };
            if source.outcome(from_outcome).is_none() {
                return Err(StateError::InvalidTransition(format!(
                    "state '{from_state}' has no outcome {from_outcome}"
                )));
            }
            if to_state == container_id {
                if !outcome_known {
                    return Err(StateError::InvalidTransition(format!(
                        "container '{container_id}' has no outcome {to_outcome:?}"
                    )));
                }
            } else if kind.is_concurrency() {
                return Err(StateError::InvalidTransition(format!(
                    "children of concurrency state '{container_id}' can only transition to it"
                )));
            } else if !container.children.contains_key(to_state) {
                return Err(StateError::InvalidTransition(format!(
                    "target '{to_state}' is neither '{container_id}' nor one of its children"
                )));
            } else if to_outcome.is_some() {
                return Err(StateError::InvalidTransition(format!(
                    "transition to child '{to_state}' cannot name a target outcome"
                )));
            }
            if let Some(existing) = container.transition_from(from_state, from_outcome) {
                return Err(StateError::InvalidTransition(format!(
                    "outcome {from_outcome} of '{from_state}' already has transition {}",
                    existing.id
                )));
            }

            let id = match id {
                Some(id) if container.transitions.contains_key(&id) => {
                    return Err(StateError::InvalidTransition(format!(
                        "transition id {id} is already used in '{container_id}'"
                    )));
                }
                Some(id) => {
                    self.allocator().reserve_transition_id(id);
                    id
                }
                None => self.allocator().transition_id(),
            };
            container.transitions.insert(
                id,
                Transition {
                    id,
                    from_state: from_state.to_string(),
                    from_outcome,
                    to_state: to_state.to_string(),
                    to_outcome,
                },
            );
            id
        };
        self.notify(StateChange::TransitionAdded { id: transition_id });
        Ok(transition_id)
    }

    /// Remove a transition by id.
    pub fn remove_transition(&self, id: TransitionId) -> Result<Transition, StateError> {
        self.ensure_idle()?;
        let removed = {
            let mut data = self.data.write();
            let container_id = data.id.clone();
            let Some(container) = data.container_mut() else {
                return Err(StateError::NotAContainer(container_id));
            };
            container
                .transitions
                .remove(&id)
                .ok_or_else(|| StateError::transition_not_found(&container_id, id))?
        };
        self.notify(StateChange::TransitionRemoved { id });
        Ok(removed)
    }

    /// Connect two ports inside this container.
    ///
    /// Sources are the container's input ports and scoped variables or a
    /// child's output ports. Targets are the container's output ports and
    /// scoped variables or a child's input ports.
    pub fn add_data_flow(
        &self,
        from_state: &str,
        from_port: PortId,
        to_state: &str,
        to_port: PortId,
    ) -> Result<DataFlowId, StateError> {
        self.put_data_flow(None, from_state, from_port, to_state, to_port)
    }

    /// Add a data flow keeping its id.
    pub(crate) fn insert_data_flow(&self, flow: &DataFlow) -> Result<DataFlowId, StateError> {
        self.put_data_flow(
            Some(flow.id),
            &flow.from_state,
            flow.from_port,
            &flow.to_state,
            flow.to_port,
        )
    }

    fn put_data_flow(
        &self,
        id: Option<DataFlowId>,
        from_state: &str,
        from_port: PortId,
        to_state: &str,
        to_port: PortId,
    ) -> Result<DataFlowId, StateError> {
        self.ensure_idle()?;
        let flow_id = {
            let mut data = self.data.write();
            let container_id = data.id.clone();
            let source_type = if from_state == container_id {
                data.input_ports
                    .get(&from_port)
                    .or_else(|| data.container().and_then(|c| c.scoped_variables.get(&from_port)))
                    .map(|p| p.data_type)
            } else {
                data.container()
                    .and_then(|c| c.children.get(from_state))
                    .and_then(|child| child.output_ports().get(&from_port).map(|p| p.data_type))
            };
            let target_type = if to_state == container_id {
                data.output_ports
                    .get(&to_port)
                    .or_else(|| data.container().and_then(|c| c.scoped_variables.get(&to_port)))
                    .map(|p| p.data_type)
            } else {
                data.container()
                    .and_then(|c| c.children.get(to_state))
                    .and_then(|child| child.input_ports().get(&to_port).map(|p| p.data_type))
            };

            let Some(container) = data.container_mut() else {
                return Err(StateError::NotAContainer(container_id));
            };
            let Some(source_type) = source_type else {
                return Err(StateError::InvalidDataFlow(format!(
                    "no source port {from_port} on '{from_state}' in '{container_id}'"
                )));
            };
            let Some(target_type) = target_type else {
                return Err(StateError::InvalidDataFlow(format!(
                    "no target port {to_port} on '{to_state}' in '{container_id}'"
                )));
            };
            if !source_type.flows_into(&target_type) {
                return Err(StateError::InvalidDataFlow(format!(
                    "cannot connect {source_type} port to {target_type} port"
                )));
            }
            if container.data_flows.values().any(|f| {
                f.from_state == from_state
                    && f.from_port == from_port
                    && f.to_state == to_state
                    && f.to_port == to_port
            }) {
                return Err(StateError::InvalidDataFlow(format!(
                    "{from_state}:{from_port} is already connected to {to_state}:{to_port}"
                )));
            }

            let id = match id {
                Some(id) if container.data_flows.contains_key(&id) => {
                    return Err(StateError::InvalidDataFlow(format!(
                        "data flow id {id} is already used in '{container_id}'"
                    )));
                }
                Some(id) => {
                    self.allocator().reserve_data_flow_id(id);
                    id
                }
                None => self.allocator().data_flow_id(),
            };
            container.data_flows.insert(
                id,
                DataFlow {
                    id,
                    from_state: from_state.to_string(),
                    from_port,
                    to_state: to_state.to_string(),
                    to_port,
                },
            );
            id
        };
        self.notify(StateChange::DataFlowAdded { id: flow_id });
        Ok(flow_id)
    }

    /// Remove a data flow by id.
    pub fn remove_data_flow(&self, id: DataFlowId) -> Result<DataFlow, StateError> {
        self.ensure_idle()?;
        let removed = {
            let mut data = self.data.write();
            let container_id = data.id.clone();
            let Some(container) = data.container_mut() else {
                return Err(StateError::NotAContainer(container_id));
            };
            container
                .data_flows
                .remove(&id)
                .ok_or_else(|| StateError::data_flow_not_found(&container_id, id))?
        };
        self.notify(StateChange::DataFlowRemoved { id });
        Ok(removed)
    }

    /// Add a variable visible to the data flows of this container.
    pub fn add_scoped_variable(
        &self,
        name: impl Into<String>,
        data_type: DataType,
        default: Option<Value>,
        id: Option<PortId>,
    ) -> Result<PortId, StateError> {
        if !self.kind().is_container() {
            return Err(self.not_a_container());
        }
        self.add_port(PortDirection::Scoped, name.into(), data_type, default, id)
    }

    /// Remove a scoped variable and the data flows through it.
    pub fn remove_scoped_variable(&self, id: PortId) -> Result<DataPort, StateError> {
        if !self.kind().is_container() {
            return Err(self.not_a_container());
        }
        self.remove_port_from(PortDirection::Scoped, id)
    }

    /// Find a state by its `/`-separated path, starting at this state.
    ///
    /// Library states are transparent: the segment after a library state
    /// names the root of its copy.
    pub fn get_state_by_path(&self, path: &str) -> Option<Arc<State>> {
        let mut segments = path.split(PATH_SEPARATOR);
        if segments.next()? != self.id() {
            return None;
        }
        let mut current = self.weak().upgrade()?;
        for segment in segments {
            let next = match &current.data.read().body {
                Body::Container(container) => container.children.get(segment).cloned(),
                Body::Library(library) => {
                    Some(Arc::clone(&library.state_copy)).filter(|copy| copy.id() == segment)
                }
                Body::Execution(_) => None,
            };
            current = next?;
        }
        Some(current)
    }
}
