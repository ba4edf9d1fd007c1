//! Running execution states.

use super::context::RunContext;
use super::script::ScriptContext;
use crate::core::{Outcome, State, ABORTED, PREEMPTED};
use crate::validation::check_data;
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn};

pub(crate) async fn run(state: Arc<State>, ctx: RunContext) -> Outcome {
    let Some(body) = state.script() else {
        error!(state_id = %state.id(), "execution state without a script body");
        return state.outcome_or_aborted(ABORTED);
    };
    let state_id = state.id();
    let input_ports = state.input_ports();
    let output_ports = state.output_ports();
    let input = state.runtime_input();

    if ctx.config().type_checking {
        if let Err(violations) = check_data(input_ports.values(), &input) {
            for violation in &violations {
                error!(state_id = %state_id, %violation, "input type mismatch");
            }
            return state.outcome_or_aborted(ABORTED);
        }
    }

    if ctx.is_preempted() {
        return state.outcome_or_aborted(PREEMPTED);
    }
    let Ok(_permit) = ctx.acquire_permit().await else {
        return state.outcome_or_aborted(PREEMPTED);
    };

    let defaults: BTreeMap<String, Value> = output_ports
        .values()
        .filter_map(|p| p.default.clone().map(|v| (p.name.clone(), v)))
        .collect();
    let script_ctx = ScriptContext::new(
        state_id.clone(),
        state.name(),
        input,
        defaults,
        ctx.token().clone(),
    );

    let result = AssertUnwindSafe(body.script.execute(script_ctx.clone()))
        .catch_unwind()
        .await;
    drop(_permit);

    let selected = match result {
        Ok(Ok(outcome_id)) => outcome_id,
        Ok(Err(err)) => {
            error!(state_id = %state_id, error = %err, "script failed");
            ABORTED
        }
        Err(_) => {
            error!(state_id = %state_id, "script panicked");
            ABORTED
        }
    };
    let mut outcome = match state.outcome(selected) {
        Some(outcome) => outcome,
        None => {
            error!(state_id = %state_id, outcome_id = selected, "script returned an unknown outcome");
            state.outcome_or_aborted(ABORTED)
        }
    };

    let mut output = script_ctx.take_outputs();
    output.retain(|name, _| {
        let declared = output_ports.values().any(|p| &p.name == name);
        if !declared {
            warn!(state_id = %state_id, port = %name, "dropping undeclared output");
        }
        declared
    });
    if ctx.config().type_checking {
        if let Err(violations) = check_data(output_ports.values(), &output) {
            for violation in &violations {
                error!(state_id = %state_id, %violation, "output type mismatch");
            }
            outcome = state.outcome_or_aborted(ABORTED);
        }
    }
    state.replace_runtime_output(output);
    outcome
}
