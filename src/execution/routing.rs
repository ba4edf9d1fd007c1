//! Data routing inside a running container.
//!
//! A [`ScopedData`] holds every value currently known in a container's
//! scope, keyed by `(state id, port id)`: the container's inputs, its scoped
//! variables and the outputs of children that already ran. Children read
//! their inputs from it along data flows.

use crate::core::{DataFlow, DataPort, PortId, State, StateId};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

pub(crate) struct ScopedData {
    container_id: StateId,
    flows: Vec<DataFlow>,
    output_ports: BTreeMap<PortId, DataPort>,
    scoped_variables: BTreeMap<PortId, DataPort>,
    values: HashMap<(StateId, PortId), Value>,
}

impl ScopedData {
    /// Snapshot the wiring of `container` and seed the scope with its
    /// runtime input and scoped variable defaults.
    pub(crate) fn for_container(container: &State) -> Self {
        let container_id = container.id();
        let input = container.runtime_input();
        let mut values = HashMap::new();

        for port in container.input_ports().into_values() {
            if let Some(value) = input.get(&port.name).or(port.default.as_ref()) {
                values.insert((container_id.clone(), port.id), value.clone());
            }
        }
        let seeded_inputs: Vec<PortId> = values.keys().map(|(_, port)| *port).collect();
        let scoped_variables = container.scoped_variables();
        for var in scoped_variables.values() {
            if let Some(default) = &var.default {
                values.insert((container_id.clone(), var.id), default.clone());
            }
        }
        let defaults: Vec<PortId> = scoped_variables
            .values()
            .filter(|var| var.default.is_some())
            .map(|var| var.id)
            .collect();

        let mut scope = Self {
            container_id,
            flows: container.data_flows().into_values().collect(),
            output_ports: container.output_ports(),
            scoped_variables,
            values,
        };
        scope.push_into_scoped(defaults);
        scope.push_into_scoped(seeded_inputs);
        scope
    }

    /// Follow flows from the container's own ports `sources` into its
    /// scoped variables, and on from there. Each variable is written once
    /// per call.
    fn push_into_scoped(&mut self, sources: Vec<PortId>) {
        let mut pending = sources;
        let mut written = HashSet::new();
        while let Some(source) = pending.pop() {
            let Some(value) = self.values.get(&(self.container_id.clone(), source)).cloned() else {
                continue;
            };
            let targets: Vec<PortId> = self
                .flows
                .iter()
                .filter(|f| {
                    f.from_state == self.container_id
                        && f.from_port == source
                        && f.to_state == self.container_id
                        && self.scoped_variables.contains_key(&f.to_port)
                })
                .map(|f| f.to_port)
                .collect();
            for target in targets {
                if written.insert(target) {
                    self.values
                        .insert((self.container_id.clone(), target), value.clone());
                    pending.push(target);
                }
            }
        }
    }

    /// Value arriving at `(state, port)`: the last flow with a known source
    /// value wins.
    fn incoming(&self, state: &str, port: PortId) -> Option<&Value> {
        self.flows
            .iter()
            .filter(|f| f.to_state == state && f.to_port == port)
            .filter_map(|f| self.values.get(&(f.from_state.clone(), f.from_port)))
            .last()
    }

    /// Input map for `child`, falling back to port defaults.
    pub(crate) fn input_for(&self, child: &State) -> BTreeMap<String, Value> {
        let child_id = child.id();
        child
            .input_ports()
            .into_values()
            .filter_map(|port| {
                let value = self
                    .incoming(&child_id, port.id)
                    .cloned()
                    .or(port.default)?;
                Some((port.name, value))
            })
            .collect()
    }

    /// Take the outputs of a finished child into the scope and push them
    /// along flows into scoped variables.
    pub(crate) fn absorb_output(&mut self, child: &State) {
        let child_id = child.id();
        let output = child.runtime_output();
        for port in child.output_ports().into_values() {
            if let Some(value) = output.get(&port.name) {
                self.values.insert((child_id.clone(), port.id), value.clone());
            }
        }

        let updates: Vec<(PortId, Value)> = self
            .flows
            .iter()
            .filter(|f| {
                f.from_state == child_id
                    && f.to_state == self.container_id
                    && self.scoped_variables.contains_key(&f.to_port)
            })
            .filter_map(|f| {
                self.values
                    .get(&(child_id.clone(), f.from_port))
                    .map(|v| (f.to_port, v.clone()))
            })
            .collect();
        let changed: Vec<PortId> = updates.iter().map(|(var, _)| *var).collect();
        for (var, value) in updates {
            self.values.insert((self.container_id.clone(), var), value);
        }
        self.push_into_scoped(changed);
    }

    /// Current value of a scoped variable.
    #[cfg(test)]
    pub(crate) fn scoped_value(&self, var: PortId) -> Option<&Value> {
        self.values.get(&(self.container_id.clone(), var))
    }

    /// Output map of the container, read from flows into its output ports.
    pub(crate) fn container_output(&self) -> BTreeMap<String, Value> {
        self.output_ports
            .values()
            .filter_map(|port| {
                let value = self
                    .incoming(&self.container_id, port.id)
                    .cloned()
                    .or_else(|| port.default.clone())?;
                Some((port.name.clone(), value))
            })
            .collect()
    }
}
