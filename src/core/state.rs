//! The state object shared by every variant of the tree.
//!
//! A [`State`] is always held in an `Arc`. Containers own their children
//! through those `Arc`s; children point back at their container through a
//! `Weak` reference, so dropping a root drops the whole tree.
//!
//! Locking rules: structural data sits behind a `parking_lot::RwLock`,
//! runtime data behind a `Mutex`. A container's lock may be held while a
//! child's lock is taken, never the other way around, and no lock is held
//! across an `.await` or while observers are notified.

use super::container::ContainerData;
use super::error::{ElementKind, StateError};
use super::events::{StateChange, StateEvent, StateObserver};
use super::history::{ExecutionHistory, ExecutionStep};
use super::ids::{IdAllocator, OutcomeId, PortId, StateId};
use super::library::LibraryData;
use super::outcome::{is_terminal_id, unique_outcome_name, Outcome, ABORTED, PREEMPTED, SUCCESS};
use super::port::{DataPort, DataType, PortDirection};
use crate::execution::Script;
use crate::validation::TypeViolation;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Separator between state ids in a path.
pub const PATH_SEPARATOR: &str = "/";

/// The closed set of state variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// Leaf running a script body.
    Execution,
    /// Sequential composite.
    Hierarchy,
    /// Composite finishing with its first child and preempting the rest.
    PreemptiveConcurrency,
    /// Composite waiting for all of its children.
    BarrierConcurrency,
    /// Indirection to a private copy of a library template.
    Library,
}

impl StateKind {
    /// Hierarchies and both concurrency kinds.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Self::Hierarchy | Self::PreemptiveConcurrency | Self::BarrierConcurrency
        )
    }

    /// Preemptive or barrier concurrency.
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::PreemptiveConcurrency | Self::BarrierConcurrency)
    }

    /// Lowercase kind name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Hierarchy => "hierarchy",
            Self::PreemptiveConcurrency => "preemptive_concurrency",
            Self::BarrierConcurrency => "barrier_concurrency",
            Self::Library => "library",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone)]
pub(crate) struct ExecutionBody {
    pub(crate) script: Arc<dyn Script>,
    pub(crate) script_key: Option<String>,
}

pub(crate) enum Body {
    Execution(ExecutionBody),
    Container(ContainerData),
    Library(LibraryData),
}

pub(crate) struct StateData {
    pub(crate) id: StateId,
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) input_ports: BTreeMap<PortId, DataPort>,
    pub(crate) output_ports: BTreeMap<PortId, DataPort>,
    pub(crate) outcomes: BTreeMap<OutcomeId, Outcome>,
    pub(crate) body: Body,
}

impl StateData {
    /// Fresh data with the three default outcomes registered once each.
    pub(crate) fn new(id: StateId, name: String, body: Body) -> Self {
        let outcomes = [Outcome::success(), Outcome::aborted(), Outcome::preempted()]
            .into_iter()
            .map(|o| (o.id, o))
            .collect();
        Self {
            id,
            name,
            description: None,
            input_ports: BTreeMap::new(),
            output_ports: BTreeMap::new(),
            outcomes,
            body,
        }
    }

    pub(crate) fn container(&self) -> Option<&ContainerData> {
        match &self.body {
            Body::Container(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn container_mut(&mut self) -> Option<&mut ContainerData> {
        match &mut self.body {
            Body::Container(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn has_port_id(&self, id: PortId) -> bool {
        self.input_ports.contains_key(&id)
            || self.output_ports.contains_key(&id)
            || self
                .container()
                .is_some_and(|c| c.scoped_variables.contains_key(&id))
    }

    fn ports_mut(&mut self, direction: PortDirection) -> Option<&mut BTreeMap<PortId, DataPort>> {
        match direction {
            PortDirection::Input => Some(&mut self.input_ports),
            PortDirection::Output => Some(&mut self.output_ports),
            PortDirection::Scoped => self.container_mut().map(|c| &mut c.scoped_variables),
        }
    }
}

pub(crate) struct RuntimeData {
    pub(crate) input: BTreeMap<String, Value>,
    pub(crate) output: BTreeMap<String, Value>,
    pub(crate) final_outcome: Option<Outcome>,
    pub(crate) token: CancellationToken,
    pub(crate) history: ExecutionHistory,
}

impl Default for RuntimeData {
    fn default() -> Self {
        Self {
            input: BTreeMap::new(),
            output: BTreeMap::new(),
            final_outcome: None,
            token: CancellationToken::new(),
            history: ExecutionHistory::new(),
        }
    }
}

/// A node of the state tree.
pub struct State {
    kind: StateKind,
    me: Weak<State>,
    allocator: IdAllocator,
    pub(crate) data: RwLock<StateData>,
    parent: RwLock<Weak<State>>,
    pub(crate) runtime: Mutex<RuntimeData>,
    active: AtomicBool,
    observers: RwLock<Vec<Arc<dyn StateObserver>>>,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read();
        f.debug_struct("State")
            .field("kind", &self.kind)
            .field("id", &data.id)
            .field("name", &data.name)
            .field("active", &self.is_active())
            .finish()
    }
}

impl State {
    pub(crate) fn from_parts(kind: StateKind, data: StateData, allocator: IdAllocator) -> Arc<Self> {
        allocator.reserve_state_id(&data.id);
        for id in data
            .input_ports
            .keys()
            .chain(data.output_ports.keys())
            .chain(data.container().into_iter().flat_map(|c| c.scoped_variables.keys()))
        {
            allocator.reserve_port_id(*id);
        }
        debug!(state_id = %data.id, name = %data.name, kind = %kind, "state initialized");

        Arc::new_cyclic(|me| Self {
            kind,
            me: me.clone(),
            allocator,
            data: RwLock::new(data),
            parent: RwLock::new(Weak::new()),
            runtime: Mutex::new(RuntimeData::default()),
            active: AtomicBool::new(false),
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Construct a state of `kind`, drawing an id when none is supplied.
    pub(crate) fn construct(
        kind: StateKind,
        id: Option<StateId>,
        name: impl Into<String>,
        body: Body,
        allocator: &IdAllocator,
    ) -> Result<Arc<Self>, StateError> {
        let name = name.into();
        if name.is_empty() {
            return Err(StateError::EmptyName);
        }
        let id = match id {
            Some(id) if id.is_empty() => return Err(StateError::EmptyName),
            Some(id) => id,
            None => allocator.state_id(),
        };
        Ok(Self::from_parts(
            kind,
            StateData::new(id, name, body),
            allocator.clone(),
        ))
    }

    pub(crate) fn construct_execution(
        id: Option<StateId>,
        name: impl Into<String>,
        script: Arc<dyn Script>,
        allocator: &IdAllocator,
    ) -> Result<Arc<Self>, StateError> {
        let body = Body::Execution(ExecutionBody {
            script,
            script_key: None,
        });
        Self::construct(StateKind::Execution, id, name, body, allocator)
    }

    pub(crate) fn construct_container(
        kind: StateKind,
        id: Option<StateId>,
        name: impl Into<String>,
        allocator: &IdAllocator,
    ) -> Result<Arc<Self>, StateError> {
        Self::construct(
            kind,
            id,
            name,
            Body::Container(ContainerData::default()),
            allocator,
        )
    }

    /// Create a leaf state running `script`.
    pub fn execution(
        name: impl Into<String>,
        script: Arc<dyn Script>,
        allocator: &IdAllocator,
    ) -> Result<Arc<Self>, StateError> {
        Self::construct_execution(None, name, script, allocator)
    }

    /// Create an empty sequential container.
    pub fn hierarchy(name: impl Into<String>, allocator: &IdAllocator) -> Result<Arc<Self>, StateError> {
        Self::construct_container(StateKind::Hierarchy, None, name, allocator)
    }

    /// Create an empty preemptive concurrency container.
    pub fn preemptive_concurrency(
        name: impl Into<String>,
        allocator: &IdAllocator,
    ) -> Result<Arc<Self>, StateError> {
        Self::construct_container(StateKind::PreemptiveConcurrency, None, name, allocator)
    }

    /// Create an empty barrier concurrency container.
    pub fn barrier_concurrency(
        name: impl Into<String>,
        allocator: &IdAllocator,
    ) -> Result<Arc<Self>, StateError> {
        Self::construct_container(StateKind::BarrierConcurrency, None, name, allocator)
    }

    // -- identity and hierarchy ---------------------------------------------

    /// What this state runs as.
    pub fn kind(&self) -> StateKind {
        self.kind
    }

    /// Id of this state, unique among its siblings.
    pub fn id(&self) -> StateId {
        self.data.read().id.clone()
    }

    /// Display name. Need not be unique.
    pub fn name(&self) -> String {
        self.data.read().name.clone()
    }

    /// Free-text description, if one was set.
    pub fn description(&self) -> Option<String> {
        self.data.read().description.clone()
    }

    /// Allocator shared by every state of this tree.
    pub fn allocator(&self) -> &IdAllocator {
        &self.allocator
    }

    /// The owning container, if this state is not a root.
    pub fn parent(&self) -> Option<Arc<State>> {
        self.parent.read().upgrade()
    }

    /// True when no container owns this state.
    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    pub(crate) fn set_parent(&self, parent: Weak<State>) {
        *self.parent.write() = parent;
    }

    pub(crate) fn weak(&self) -> Weak<State> {
        self.me.clone()
    }

    /// Path of ids from the root down to this state, separated by `/`.
    pub fn path(&self) -> String {
        let mut segments = vec![self.id()];
        let mut current = self.parent();
        while let Some(state) = current {
            segments.push(state.id());
            current = state.parent();
        }
        segments.reverse();
        segments.join(PATH_SEPARATOR)
    }

    /// Rename the state. Empty names are rejected.
    pub fn set_name(&self, name: impl Into<String>) -> Result<(), StateError> {
        let name = name.into();
        if name.is_empty() {
            return Err(StateError::EmptyName);
        }
        self.data.write().name = name.clone();
        self.notify(StateChange::NameChanged { name });
        Ok(())
    }

    /// Replace the free-text description.
    pub fn set_description(&self, description: impl Into<String>) -> Result<(), StateError> {
        let description = description.into();
        if description.is_empty() {
            return Err(StateError::InvariantViolation(
                "description must have at least one character".to_string(),
            ));
        }
        self.data.write().description = Some(description);
        self.notify(StateChange::DescriptionChanged);
        Ok(())
    }

    /// Change the id of this state.
    ///
    /// Without an explicit id a new one is drawn from the allocator. While the
    /// parent already has a child with the chosen id, a fresh id is drawn.
    /// The parent's child map, transitions and data flows follow the rename.
    pub fn change_id(&self, new_id: Option<StateId>) -> Result<StateId, StateError> {
        self.ensure_idle()?;
        let mut candidate = new_id.unwrap_or_else(|| self.allocator.state_id());
        if candidate.is_empty() {
            return Err(StateError::EmptyName);
        }
        let old = self.id();
        if candidate == old {
            return Ok(old);
        }

        // A library copy's root only has to avoid its own children.
        match self.parent().filter(|p| p.kind() != StateKind::Library) {
            Some(parent) => {
                let mut parent_data = parent.data.write();
                let parent_id = parent_data.id.clone();
                let Some(container) = parent_data.container_mut() else {
                    return Err(StateError::NotAContainer(parent_id));
                };
                while candidate == parent_id
                    || container.children.contains_key(&candidate)
                    || self.clashes_with_own_child(&candidate)
                {
                    candidate = self.allocator.state_id();
                }
                if let Some(child) = container.children.remove(&old) {
                    container.children.insert(candidate.clone(), child);
                }
                container.rename_references(&old, &candidate);
                self.rename_self(&old, &candidate);
            }
            None => {
                while self.clashes_with_own_child(&candidate) {
                    candidate = self.allocator.state_id();
                }
                self.rename_self(&old, &candidate);
            }
        }

        self.allocator.reserve_state_id(&candidate);
        debug!(old = %old, new = %candidate, "state id changed");
        self.notify(StateChange::IdChanged {
            old,
            new: candidate.clone(),
        });
        Ok(candidate)
    }

    fn clashes_with_own_child(&self, candidate: &str) -> bool {
        self.data
            .read()
            .container()
            .is_some_and(|c| c.children.contains_key(candidate))
    }

    fn rename_self(&self, old: &str, new: &str) {
        let mut data = self.data.write();
        data.id = new.to_string();
        if let Some(container) = data.container_mut() {
            container.rename_references(old, new);
        }
    }

    /// Fail with [`StateError::StateActive`] if this state or any ancestor is
    /// running.
    pub(crate) fn ensure_idle(&self) -> Result<(), StateError> {
        if self.is_active() {
            return Err(StateError::StateActive(self.id()));
        }
        let mut current = self.parent();
        while let Some(state) = current {
            if state.is_active() {
                return Err(StateError::StateActive(state.id()));
            }
            current = state.parent();
        }
        Ok(())
    }

    // -- data ports ---------------------------------------------------------

    /// Snapshot of the input ports by id.
    pub fn input_ports(&self) -> BTreeMap<PortId, DataPort> {
        self.data.read().input_ports.clone()
    }

    /// Snapshot of the output ports by id.
    pub fn output_ports(&self) -> BTreeMap<PortId, DataPort> {
        self.data.read().output_ports.clone()
    }

    /// Look up an input or output port by id.
    pub fn port(&self, id: PortId) -> Option<DataPort> {
        let data = self.data.read();
        data.input_ports
            .get(&id)
            .or_else(|| data.output_ports.get(&id))
            .cloned()
    }

    /// Look up a port by name on one side of the state.
    pub fn port_by_name(&self, name: &str, direction: PortDirection) -> Option<DataPort> {
        let data = self.data.read();
        let ports = match direction {
            PortDirection::Input => &data.input_ports,
            PortDirection::Output => &data.output_ports,
            PortDirection::Scoped => &data.container()?.scoped_variables,
        };
        ports.values().find(|p| p.name == name).cloned()
    }

    /// Add an input port, returning its new id.
    pub fn add_input_port(
        &self,
        name: impl Into<String>,
        data_type: DataType,
        default: Option<Value>,
        id: Option<PortId>,
    ) -> Result<PortId, StateError> {
        self.add_port(PortDirection::Input, name.into(), data_type, default, id)
    }

    /// Add an output port, returning its new id.
    pub fn add_output_port(
        &self,
        name: impl Into<String>,
        data_type: DataType,
        default: Option<Value>,
        id: Option<PortId>,
    ) -> Result<PortId, StateError> {
        self.add_port(PortDirection::Output, name.into(), data_type, default, id)
    }

    pub(crate) fn add_port(
        &self,
        direction: PortDirection,
        name: String,
        data_type: DataType,
        default: Option<Value>,
        id: Option<PortId>,
    ) -> Result<PortId, StateError> {
        self.ensure_idle()?;
        if name.is_empty() {
            return Err(StateError::EmptyName);
        }
        if let Some(value) = &default {
            if !data_type.accepts(value) {
                return Err(StateError::TypeMismatch(TypeViolation {
                    port: name,
                    expected: data_type,
                    found: value.to_string(),
                }));
            }
        }

        let port_id = {
            let mut data = self.data.write();
            let state_id = data.id.clone();
            let port_id = match id {
                Some(id) => {
                    if data.has_port_id(id) {
                        return Err(StateError::DuplicatePort { state: state_id, id });
                    }
                    self.allocator.reserve_port_id(id);
                    id
                }
                None => loop {
                    let candidate = self.allocator.port_id();
                    if !data.has_port_id(candidate) {
                        break candidate;
                    }
                },
            };
            let Some(ports) = data.ports_mut(direction) else {
                return Err(StateError::NotAContainer(state_id));
            };
            let mut port = DataPort::new(port_id, name, data_type);
            port.default = default;
            ports.insert(port_id, port);
            port_id
        };

        self.notify(StateChange::PortAdded {
            id: port_id,
            direction,
        });
        Ok(port_id)
    }

    /// Remove an input port and every data flow that uses it.
    pub fn remove_input_port(&self, id: PortId) -> Result<DataPort, StateError> {
        self.remove_port_from(PortDirection::Input, id)
    }

    /// Remove an output port and every data flow that uses it.
    pub fn remove_output_port(&self, id: PortId) -> Result<DataPort, StateError> {
        self.remove_port_from(PortDirection::Output, id)
    }

    /// Remove an input or output port, whichever holds `id`.
    pub fn remove_port(&self, id: PortId) -> Result<DataPort, StateError> {
        let direction = {
            let data = self.data.read();
            if data.input_ports.contains_key(&id) {
                PortDirection::Input
            } else if data.output_ports.contains_key(&id) {
                PortDirection::Output
            } else {
                return Err(StateError::port_not_found(&data.id, id));
            }
        };
        self.remove_port_from(direction, id)
    }

    /// Remove a port and every data flow that references it, both inside
    /// this state and in its parent.
    pub(crate) fn remove_port_from(
        &self,
        direction: PortDirection,
        id: PortId,
    ) -> Result<DataPort, StateError> {
        self.ensure_idle()?;
        let (state_id, port, own_flows) = {
            let mut data = self.data.write();
            let state_id = data.id.clone();
            let kind = match direction {
                PortDirection::Scoped => ElementKind::ScopedVariable,
                _ => ElementKind::Port,
            };
            let removed = data
                .ports_mut(direction)
                .and_then(|ports| ports.remove(&id));
            let Some(port) = removed else {
                return Err(StateError::not_found(&state_id, kind, id));
            };
            let own_flows = data
                .container_mut()
                .map(|c| c.remove_flows_touching(&state_id, id))
                .unwrap_or_default();
            (state_id, port, own_flows)
        };

        let parent_flows = match self.parent() {
            Some(parent) => {
                let removed = parent
                    .data
                    .write()
                    .container_mut()
                    .map(|c| c.remove_flows_touching(&state_id, id))
                    .unwrap_or_default();
                for flow_id in &removed {
                    parent.notify(StateChange::DataFlowRemoved { id: *flow_id });
                }
                removed
            }
            None => Vec::new(),
        };

        for flow_id in &own_flows {
            self.notify(StateChange::DataFlowRemoved { id: *flow_id });
        }
        debug!(
            state_id = %state_id,
            port_id = id,
            flows_removed = own_flows.len() + parent_flows.len(),
            "data port removed"
        );
        self.notify(StateChange::PortRemoved { id, direction });
        Ok(port)
    }

    // -- outcomes -----------------------------------------------------------

    /// All outcomes, terminal ones included.
    pub fn outcomes(&self) -> BTreeMap<OutcomeId, Outcome> {
        self.data.read().outcomes.clone()
    }

    /// Outcome by id.
    pub fn outcome(&self, id: OutcomeId) -> Option<Outcome> {
        self.data.read().outcomes.get(&id).cloned()
    }

    /// The outcome with `id`, or this state's `aborted` outcome if there is
    /// no such outcome.
    pub(crate) fn outcome_or_aborted(&self, id: OutcomeId) -> Outcome {
        match self.outcome(id) {
            Some(outcome) => outcome,
            None => {
                warn!(state_id = %self.id(), outcome_id = id, "unknown outcome, resolving to aborted");
                self.outcome(ABORTED).unwrap_or_else(Outcome::aborted)
            }
        }
    }

    /// Add an outcome. A name already taken by another outcome gets the
    /// smallest free integer suffix (`done`, `done1`, ...). A duplicate id is
    /// reported as [`StateError::DuplicateOutcome`] and leaves the state
    /// unchanged.
    pub fn add_outcome(
        &self,
        name: impl Into<String>,
        id: Option<OutcomeId>,
    ) -> Result<OutcomeId, StateError> {
        self.ensure_idle()?;
        let proposed = name.into();
        if proposed.is_empty() {
            return Err(StateError::EmptyName);
        }
        let outcome_id = {
            let mut data = self.data.write();
            let name = unique_outcome_name(
                &proposed,
                data.outcomes.values().map(|o| o.name.as_str()),
            );
            if name != proposed {
                debug!(state_id = %data.id, proposed = %proposed, name = %name, "outcome name taken, suffixed");
            }
            let outcome_id = match id {
                Some(id) if data.outcomes.contains_key(&id) => {
                    error!(state_id = %data.id, outcome_id = id, "two outcomes cannot have the same id");
                    return Err(StateError::DuplicateOutcome {
                        state: data.id.clone(),
                        what: format!("id {id}"),
                    });
                }
                Some(id) => id,
                None => self.allocator.outcome_id(data.outcomes.keys()),
            };
            data.outcomes
                .insert(outcome_id, Outcome::new(outcome_id, name));
            outcome_id
        };
        self.notify(StateChange::OutcomeAdded { id: outcome_id });
        Ok(outcome_id)
    }

    /// Remove an outcome together with the parent transition leaving it.
    ///
    /// `aborted` (-1) and `preempted` (-2) can never be removed.
    pub fn remove_outcome(&self, id: OutcomeId) -> Result<Outcome, StateError> {
        self.ensure_idle()?;
        let (state_id, removed, own_transitions) = {
            let mut data = self.data.write();
            let state_id = data.id.clone();
            if !data.outcomes.contains_key(&id) {
                return Err(StateError::outcome_not_found(&state_id, id));
            }
            if is_terminal_id(id) {
                return Err(StateError::InvariantViolation(format!(
                    "outcome {id} of state '{state_id}' is terminal and cannot be removed"
                )));
            }
            let removed = data.outcomes.remove(&id);
            let own_transitions = data
                .container_mut()
                .map(|c| c.remove_transitions_into_self(&state_id, id))
                .unwrap_or_default();
            (state_id, removed, own_transitions)
        };

        if let Some(parent) = self.parent() {
            let removed_transition = parent
                .data
                .write()
                .container_mut()
                .and_then(|c| c.remove_transition_from(&state_id, id));
            if let Some(transition_id) = removed_transition {
                parent.notify(StateChange::TransitionRemoved { id: transition_id });
            }
        }
        for transition_id in own_transitions {
            self.notify(StateChange::TransitionRemoved { id: transition_id });
        }
        self.notify(StateChange::OutcomeRemoved { id });
        removed.ok_or_else(|| StateError::outcome_not_found(&state_id, id))
    }

    /// Name `outcome_id` would get if renamed to `proposed`: unchanged when
    /// free, otherwise suffixed with the smallest unused positive integer.
    pub fn rename_outcome_if_colliding(&self, proposed: &str, outcome_id: OutcomeId) -> String {
        let data = self.data.read();
        unique_outcome_name(
            proposed,
            data.outcomes
                .values()
                .filter(|o| o.id != outcome_id)
                .map(|o| o.name.as_str()),
        )
    }

    /// Rename an outcome, resolving name collisions by suffixing.
    pub fn rename_outcome(
        &self,
        id: OutcomeId,
        proposed: impl AsRef<str>,
    ) -> Result<String, StateError> {
        self.ensure_idle()?;
        let proposed = proposed.as_ref();
        if proposed.is_empty() {
            return Err(StateError::EmptyName);
        }
        let name = self.rename_outcome_if_colliding(proposed, id);
        {
            let mut data = self.data.write();
            let state_id = data.id.clone();
            let outcome = data
                .outcomes
                .get_mut(&id)
                .ok_or_else(|| StateError::outcome_not_found(&state_id, id))?;
            outcome.name = name.clone();
        }
        self.notify(StateChange::OutcomeRenamed {
            id,
            name: name.clone(),
        });
        Ok(name)
    }

    // -- runtime data -------------------------------------------------------

    /// Whether a run of this state is in progress.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the current (or last) run has been asked to stop.
    pub fn is_preempted(&self) -> bool {
        self.runtime.lock().token.is_cancelled()
    }

    /// Ask the current run of this state, and of every descendant, to stop.
    pub fn preempt(&self) {
        let token = self.runtime.lock().token.clone();
        if !token.is_cancelled() {
            token.cancel();
            debug!(state_id = %self.id(), "state preempted");
            self.notify(StateChange::Preempted);
        }
    }

    /// Input values of the current or last run, keyed by port name.
    pub fn runtime_input(&self) -> BTreeMap<String, Value> {
        self.runtime.lock().input.clone()
    }

    /// Output values written by the last run.
    pub fn runtime_output(&self) -> BTreeMap<String, Value> {
        self.runtime.lock().output.clone()
    }

    /// Outcome of the last finished run. `None` while running.
    pub fn final_outcome(&self) -> Option<Outcome> {
        self.runtime.lock().final_outcome.clone()
    }

    /// Children run by the last container run, in completion order.
    pub fn history(&self) -> ExecutionHistory {
        self.runtime.lock().history.clone()
    }

    /// Seed the input of the next run. Fails while running.
    pub fn set_runtime_input(&self, input: BTreeMap<String, Value>) -> Result<(), StateError> {
        if self.is_active() {
            return Err(StateError::StateActive(self.id()));
        }
        self.replace_runtime_input(input);
        Ok(())
    }

    /// Set runtime input from a JSON value, which must be an object.
    pub fn set_runtime_input_value(&self, input: Value) -> Result<(), StateError> {
        match input {
            Value::Object(map) => self.set_runtime_input(map.into_iter().collect()),
            other => Err(StateError::MalformedData(json_kind(&other).to_string())),
        }
    }

    pub(crate) fn replace_runtime_input(&self, input: BTreeMap<String, Value>) {
        self.runtime.lock().input = input;
    }

    pub(crate) fn replace_runtime_output(&self, output: BTreeMap<String, Value>) {
        self.runtime.lock().output = output;
    }

    pub(crate) fn record_step(&self, step: ExecutionStep) {
        self.runtime.lock().history.record(step);
    }

    /// Mark the state active under `token`, clearing results of a previous
    /// run.
    pub(crate) fn begin_run(&self, token: &CancellationToken) {
        {
            let mut runtime = self.runtime.lock();
            runtime.token = token.clone();
            runtime.output.clear();
            runtime.final_outcome = None;
            runtime.history = ExecutionHistory::new();
        }
        self.active.store(true, Ordering::SeqCst);
        self.notify(StateChange::ActiveChanged { active: true });
    }

    /// Store the final outcome and mark the state inactive.
    pub(crate) fn finish_run(&self, outcome: Outcome) -> Outcome {
        let preempted = {
            let mut runtime = self.runtime.lock();
            runtime.final_outcome = Some(outcome.clone());
            runtime.token.is_cancelled()
        };
        self.active.store(false, Ordering::SeqCst);
        if preempted && outcome.id == PREEMPTED {
            self.notify(StateChange::Preempted);
        }
        self.notify(StateChange::ActiveChanged { active: false });
        outcome
    }

    // -- observers ----------------------------------------------------------

    /// Receive events for this state and all of its descendants.
    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) {
        self.observers.write().push(observer);
    }

    pub(crate) fn notify(&self, change: StateChange) {
        let event = StateEvent {
            state_id: self.id(),
            path: self.path(),
            change,
        };
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_event(&event);
        }
        let mut current = self.parent();
        while let Some(state) = current {
            let observers = state.observers.read().clone();
            for observer in observers {
                observer.on_event(&event);
            }
            current = state.parent();
        }
    }

    // -- copies -------------------------------------------------------------

    /// Deep copy of this subtree with fresh runtime state. Ids and structure
    /// are preserved; scripts are shared.
    pub(crate) fn duplicate(&self) -> Arc<State> {
        let data = self.data.read();
        let body = match &data.body {
            Body::Execution(body) => Body::Execution(body.clone()),
            Body::Container(container) => Body::Container(container.duplicate()),
            Body::Library(library) => Body::Library(LibraryData {
                reference: library.reference.clone(),
                state_copy: library.state_copy.duplicate(),
            }),
        };
        let copy = StateData {
            id: data.id.clone(),
            name: data.name.clone(),
            description: data.description.clone(),
            input_ports: data.input_ports.clone(),
            output_ports: data.output_ports.clone(),
            outcomes: data.outcomes.clone(),
            body,
        };
        let state = State::from_parts(self.kind, copy, self.allocator.clone());
        state.adopt_children();
        state
    }

    /// Point every directly owned state back at this one.
    pub(crate) fn adopt_children(&self) {
        let data = self.data.read();
        match &data.body {
            Body::Container(container) => {
                for child in container.children.values() {
                    child.set_parent(self.weak());
                }
            }
            Body::Library(library) => library.state_copy.set_parent(self.weak()),
            Body::Execution(_) => {}
        }
    }

    pub(crate) fn script(&self) -> Option<ExecutionBody> {
        match &self.data.read().body {
            Body::Execution(body) => Some(body.clone()),
            _ => None,
        }
    }

    /// Key under which the script body is registered, if any.
    pub fn script_key(&self) -> Option<String> {
        self.script().and_then(|body| body.script_key)
    }

    pub(crate) fn set_script_key(&self, key: Option<String>) {
        if let Body::Execution(body) = &mut self.data.write().body {
            body.script_key = key;
        }
    }

    /// Replace the body of an execution state.
    pub fn set_script(&self, script: Arc<dyn Script>) -> Result<(), StateError> {
        self.ensure_idle()?;
        let mut data = self.data.write();
        let state_id = data.id.clone();
        match &mut data.body {
            Body::Execution(body) => {
                body.script = script;
                Ok(())
            }
            _ => Err(StateError::InvariantViolation(format!(
                "state '{state_id}' has no script body"
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Outcome ids every state starts with.
pub const DEFAULT_OUTCOME_IDS: [OutcomeId; 3] = [SUCCESS, ABORTED, PREEMPTED];
