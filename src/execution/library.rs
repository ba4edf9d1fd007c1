//! Running library states through their private copy.

use super::context::RunContext;
use crate::core::{Outcome, State, ABORTED};
use std::sync::Arc;
use tracing::{debug, error};

pub(crate) async fn run(state: Arc<State>, ctx: RunContext) -> Outcome {
    let Some(copy) = state.library_copy() else {
        error!(state_id = %state.id(), "library state without a copy");
        return state.outcome_or_aborted(ABORTED);
    };
    copy.replace_runtime_input(state.runtime_input());
    let inner = copy.run(ctx.child()).await;
    state.replace_runtime_output(copy.runtime_output());
    debug!(state_id = %state.id(), copy = %copy.id(), outcome = %inner, "library copy finished");
    state.outcome_or_aborted(inner.id)
}
