//! Running hierarchy states: children one after another along transitions.

use super::context::RunContext;
use super::routing::ScopedData;
use crate::core::{ExecutionStep, Outcome, State, ABORTED, PREEMPTED};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info};

pub(crate) async fn run(state: Arc<State>, ctx: RunContext) -> Outcome {
    let container_id = state.id();
    let mut scope = ScopedData::for_container(&state);

    let Some(mut current_id) = state.start_state_id() else {
        error!(state_id = %container_id, "hierarchy state has no start state");
        return state.outcome_or_aborted(ABORTED);
    };

    let outcome = loop {
        if ctx.is_preempted() {
            break state.outcome_or_aborted(PREEMPTED);
        }
        let Some(child) = state.child(&current_id) else {
            error!(state_id = %container_id, child = %current_id, "transition target is missing");
            break state.outcome_or_aborted(ABORTED);
        };

        child.replace_runtime_input(scope.input_for(&child));
        let started_at = Utc::now();
        let child_outcome = child.run(ctx.child()).await;
        scope.absorb_output(&child);
        state.record_step(ExecutionStep {
            state_id: current_id.clone(),
            outcome: child_outcome.clone(),
            started_at,
            finished_at: Utc::now(),
        });

        if ctx.is_preempted() {
            break state.outcome_or_aborted(PREEMPTED);
        }
        match state.transition_from(&current_id, child_outcome.id) {
            Some(transition) if transition.to_state == container_id => {
                let target = transition.to_outcome.unwrap_or(ABORTED);
                debug!(state_id = %container_id, child = %current_id, outcome = target, "leaving hierarchy");
                break state.outcome_or_aborted(target);
            }
            Some(transition) => {
                info!(
                    state_id = %container_id,
                    from = %current_id,
                    outcome = %child_outcome,
                    to = %transition.to_state,
                    "transition"
                );
                current_id = transition.to_state;
            }
            None => {
                debug!(state_id = %container_id, child = %current_id, outcome = %child_outcome, "no transition, mirroring child outcome");
                break state.outcome_or_aborted(child_outcome.id);
            }
        }
    };

    state.replace_runtime_output(scope.container_output());
    outcome
}

#[cfg(test)]
mod tests {
    use crate::core::{DataType, IdAllocator, State, ABORTED, PREEMPTED, SUCCESS};
    use crate::execution::{script_fn, EmptyScript, RunContext, ScriptContext, ScriptError};
    use serde_json::json;
    use std::sync::Arc;

    fn leaf(name: &str, ids: &IdAllocator) -> Arc<State> {
        State::execution(name, Arc::new(EmptyScript), ids).unwrap()
    }

    #[tokio::test]
    async fn runs_children_along_transitions() {
        let ids = IdAllocator::sequential();
        let root = State::hierarchy("root", &ids).unwrap();
        let a = root.add_state(leaf("A", &ids)).unwrap();
        let b = root.add_state(leaf("B", &ids)).unwrap();
        root.add_transition(&a, SUCCESS, &b, None).unwrap();
        root.add_transition(&b, SUCCESS, &root.id(), Some(SUCCESS))
            .unwrap();

        let outcome = root.run(RunContext::default()).await;
        assert_eq!(outcome.id, SUCCESS);
        assert_eq!(root.history().visited(), vec![a.as_str(), b.as_str()]);
    }

    #[tokio::test]
    async fn missing_transition_mirrors_child_outcome() {
        let ids = IdAllocator::sequential();
        let root = State::hierarchy("root", &ids).unwrap();
        let child = State::execution(
            "fails",
            script_fn(|_ctx: ScriptContext| async move { Err(ScriptError::failed("no")) }),
            &ids,
        )
        .unwrap();
        root.add_state(child).unwrap();

        assert_eq!(root.run(RunContext::default()).await.id, ABORTED);
    }

    #[tokio::test]
    async fn mirrored_outcome_unknown_to_container_aborts() {
        let ids = IdAllocator::sequential();
        let root = State::hierarchy("root", &ids).unwrap();
        let child = State::execution(
            "custom",
            script_fn(|_ctx: ScriptContext| async move { Ok(1) }),
            &ids,
        )
        .unwrap();
        child.add_outcome("special", Some(1)).unwrap();
        root.add_state(child).unwrap();

        assert_eq!(root.run(RunContext::default()).await.id, ABORTED);
    }

    #[tokio::test]
    async fn empty_hierarchy_aborts() {
        let ids = IdAllocator::sequential();
        let root = State::hierarchy("root", &ids).unwrap();
        assert_eq!(root.run(RunContext::default()).await.id, ABORTED);
    }

    #[tokio::test]
    async fn data_flows_between_children() {
        let ids = IdAllocator::sequential();
        let root = State::hierarchy("root", &ids).unwrap();
        let root_id = root.id();
        let n = root.add_input_port("n", DataType::Int, None, None).unwrap();
        let total = root.add_output_port("total", DataType::Int, None, None).unwrap();

        let inc = |name: &str| {
            let state = State::execution(
                name,
                script_fn(|ctx: ScriptContext| async move {
                    let x: i64 = ctx.input_as("x")?;
                    ctx.set_output("y", x + 1);
                    Ok::<_, ScriptError>(SUCCESS)
                }),
                &ids,
            )
            .unwrap();
            let x = state.add_input_port("x", DataType::Int, None, None).unwrap();
            let y = state.add_output_port("y", DataType::Int, None, None).unwrap();
            (state, x, y)
        };
        let (a, a_in, a_out) = inc("A");
        let (b, b_in, b_out) = inc("B");
        let a_id = root.add_state(a).unwrap();
        let b_id = root.add_state(b).unwrap();
        root.add_transition(&a_id, SUCCESS, &b_id, None).unwrap();
        root.add_transition(&b_id, SUCCESS, &root_id, Some(SUCCESS))
            .unwrap();
        root.add_data_flow(&root_id, n, &a_id, a_in).unwrap();
        root.add_data_flow(&a_id, a_out, &b_id, b_in).unwrap();
        root.add_data_flow(&b_id, b_out, &root_id, total).unwrap();
        root.set_runtime_input_value(json!({"n": 1})).unwrap();

        assert_eq!(root.run(RunContext::default()).await.id, SUCCESS);
        assert_eq!(root.runtime_output().get("total"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn preempted_before_start_returns_preempted() {
        let ids = IdAllocator::sequential();
        let root = State::hierarchy("root", &ids).unwrap();
        root.add_state(leaf("A", &ids)).unwrap();
        let ctx = RunContext::default();
        ctx.token().cancel();

        assert_eq!(root.run(ctx).await.id, PREEMPTED);
        assert!(root.history().is_empty());
    }

    #[tokio::test]
    async fn container_input_reaches_child_through_scoped_variable() {
        let ids = IdAllocator::sequential();
        let root = State::hierarchy("root", &ids).unwrap();
        let root_id = root.id();
        let n = root.add_input_port("n", DataType::Int, None, None).unwrap();
        let out = root.add_output_port("out", DataType::Int, None, None).unwrap();
        let sv = root
            .add_scoped_variable("sv", DataType::Int, Some(json!(0)), None)
            .unwrap();
        let echo = State::execution(
            "echo",
            script_fn(|ctx: ScriptContext| async move {
                let v: i64 = ctx.input_as("v")?;
                ctx.set_output("v", v);
                Ok::<_, ScriptError>(SUCCESS)
            }),
            &ids,
        )
        .unwrap();
        let v_in = echo.add_input_port("v", DataType::Int, None, None).unwrap();
        let v_out = echo.add_output_port("v", DataType::Int, None, None).unwrap();
        let echo_id = root.add_state(echo).unwrap();
        root.add_data_flow(&root_id, n, &root_id, sv).unwrap();
        root.add_data_flow(&root_id, sv, &echo_id, v_in).unwrap();
        root.add_data_flow(&echo_id, v_out, &root_id, out).unwrap();
        root.set_runtime_input_value(json!({"n": 7})).unwrap();

        assert_eq!(root.run(RunContext::default()).await.id, SUCCESS);
        assert_eq!(root.runtime_output().get("out"), Some(&json!(7)));
    }
}
