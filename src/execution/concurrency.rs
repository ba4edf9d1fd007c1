//! Running concurrency states.
//!
//! Every child runs on its own tokio task under its own child token and
//! reports its id on a completion channel when done. The composite never
//! returns before all of its children have finished.

use super::context::RunContext;
use super::routing::ScopedData;
use crate::core::{ExecutionStep, Outcome, State, StateId, ABORTED, PREEMPTED, SUCCESS};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Branch {
    child: Arc<State>,
    token: CancellationToken,
    handle: JoinHandle<Outcome>,
}

/// A child that reported completion, and when.
type Finished = (StateId, DateTime<Utc>);

struct Launch {
    branches: Vec<Branch>,
    done: mpsc::UnboundedReceiver<Finished>,
    started_at: DateTime<Utc>,
}

/// Spawn one task per child, handing each its routed input.
fn launch(state: &State, scope: &ScopedData, ctx: &RunContext) -> Launch {
    let (tx, done) = mpsc::unbounded_channel();
    let started_at = Utc::now();
    let branches = state
        .children()
        .into_iter()
        .map(|child| {
            child.replace_runtime_input(scope.input_for(&child));
            let child_ctx = ctx.child();
            let token = child_ctx.token().clone();
            let tx = tx.clone();
            let task_child = Arc::clone(&child);
            let handle = tokio::spawn(async move {
                let outcome = task_child.run(child_ctx).await;
                let _ = tx.send((task_child.id(), Utc::now()));
                outcome
            });
            Branch {
                child,
                token,
                handle,
            }
        })
        .collect();
    Launch {
        branches,
        done,
        started_at,
    }
}

/// Join every branch. A task that panicked counts as `aborted`.
async fn join_all(branches: Vec<Branch>) -> HashMap<StateId, (Arc<State>, Outcome)> {
    let mut outcomes = HashMap::new();
    for branch in branches {
        let id = branch.child.id();
        let outcome = match branch.handle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(child = %id, error = %err, "child task failed");
                Outcome::aborted()
            }
        };
        outcomes.insert(id, (branch.child, outcome));
    }
    outcomes
}

/// Record finished children in completion order; children that never
/// reported follow in id order. Returns the recorded order.
fn record_history(
    state: &State,
    mut reported: Vec<Finished>,
    done: &mut mpsc::UnboundedReceiver<Finished>,
    outcomes: &HashMap<StateId, (Arc<State>, Outcome)>,
    started_at: DateTime<Utc>,
) -> Vec<StateId> {
    while let Ok(finished) = done.try_recv() {
        reported.push(finished);
    }
    let now = Utc::now();
    let mut missing: Vec<Finished> = outcomes
        .keys()
        .filter(|id| !reported.iter().any(|(seen, _)| seen == *id))
        .map(|id| (id.clone(), now))
        .collect();
    missing.sort();
    reported.extend(missing);

    for (id, finished_at) in &reported {
        if let Some((_, outcome)) = outcomes.get(id) {
            state.record_step(ExecutionStep {
                state_id: id.clone(),
                outcome: outcome.clone(),
                started_at,
                finished_at: *finished_at,
            });
        }
    }
    reported.into_iter().map(|(id, _)| id).collect()
}

pub(crate) async fn run_preemptive(state: Arc<State>, ctx: RunContext) -> Outcome {
    let container_id = state.id();
    let mut scope = ScopedData::for_container(&state);
    let Launch {
        branches,
        mut done,
        started_at,
    } = launch(&state, &scope, &ctx);
    if branches.is_empty() {
        warn!(state_id = %container_id, "preemptive concurrency state has no children");
        return state.outcome_or_aborted(ABORTED);
    }

    let first = done.recv().await;
    let winner = first.as_ref().map(|(id, _)| id.clone());
    if let Some(winner_id) = &winner {
        info!(state_id = %container_id, winner = %winner_id, "first child finished, preempting siblings");
        for branch in branches.iter().filter(|b| &b.child.id() != winner_id) {
            branch.token.cancel();
        }
    }

    let outcomes = join_all(branches).await;
    record_history(&state, first.into_iter().collect(), &mut done, &outcomes, started_at);

    if ctx.is_preempted() {
        return state.outcome_or_aborted(PREEMPTED);
    }
    let Some((child, child_outcome)) = winner.as_ref().and_then(|id| outcomes.get(id)) else {
        error!(state_id = %container_id, "no child reported completion");
        return state.outcome_or_aborted(ABORTED);
    };

    scope.absorb_output(child);
    state.replace_runtime_output(scope.container_output());

    let child_id = child.id();
    match state.transition_from(&child_id, child_outcome.id) {
        Some(transition) => {
            let target = transition.to_outcome.unwrap_or(ABORTED);
            debug!(state_id = %container_id, winner = %child_id, outcome = target, "leaving preemptive concurrency");
            state.outcome_or_aborted(target)
        }
        None => state.outcome_or_aborted(child_outcome.id),
    }
}

pub(crate) async fn run_barrier(state: Arc<State>, ctx: RunContext) -> Outcome {
    let container_id = state.id();
    let mut scope = ScopedData::for_container(&state);
    let Launch {
        branches,
        mut done,
        started_at,
    } = launch(&state, &scope, &ctx);

    let outcomes = join_all(branches).await;
    let order = record_history(&state, Vec::new(), &mut done, &outcomes, started_at);
    for id in &order {
        if let Some((child, _)) = outcomes.get(id) {
            scope.absorb_output(child);
        }
    }
    state.replace_runtime_output(scope.container_output());

    if ctx.is_preempted() {
        return state.outcome_or_aborted(PREEMPTED);
    }
    let aborted: Vec<&StateId> = outcomes
        .iter()
        .filter(|(_, (_, outcome))| outcome.id == ABORTED)
        .map(|(id, _)| id)
        .collect();
    if !aborted.is_empty() {
        warn!(state_id = %container_id, aborted = ?aborted, "barrier children aborted");
        return state.outcome_or_aborted(ABORTED);
    }
    debug!(state_id = %container_id, children = outcomes.len(), "all barrier children finished");
    state.outcome_or_aborted(SUCCESS)
}

#[cfg(test)]
mod tests {
    use crate::core::{DataType, IdAllocator, State, ABORTED, PREEMPTED, SUCCESS};
    use crate::execution::{script_fn, RunContext, ScriptContext, ScriptError};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn sleeper(name: &str, millis: u64, ids: &IdAllocator) -> Arc<State> {
        State::execution(
            name,
            script_fn(move |ctx: ScriptContext| async move {
                if ctx.sleep(Duration::from_millis(millis)).await {
                    Ok(SUCCESS)
                } else {
                    Ok(PREEMPTED)
                }
            }),
            ids,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn first_finisher_wins_and_preempts_siblings() {
        let ids = IdAllocator::sequential();
        let race = State::preemptive_concurrency("race", &ids).unwrap();
        let fast = sleeper("fast", 10, &ids);
        let slow = sleeper("slow", 10_000, &ids);
        let fast_id = race.add_state(Arc::clone(&fast)).unwrap();
        race.add_state(Arc::clone(&slow)).unwrap();
        race.add_transition(&fast_id, SUCCESS, &race.id(), Some(SUCCESS))
            .unwrap();

        let outcome = race.run(RunContext::default()).await;
        assert_eq!(outcome.id, SUCCESS);
        assert_eq!(fast.final_outcome().unwrap().id, SUCCESS);
        assert_eq!(slow.final_outcome().unwrap().id, PREEMPTED);
        assert!(!fast.is_preempted());
        assert!(!slow.is_active());
        assert_eq!(race.history().visited()[0], fast_id);
    }

    #[tokio::test]
    async fn winner_without_transition_is_mirrored() {
        let ids = IdAllocator::sequential();
        let race = State::preemptive_concurrency("race", &ids).unwrap();
        race.add_state(State::execution(
            "fails",
            script_fn(|_ctx: ScriptContext| async move { Err(ScriptError::failed("x")) }),
            &ids,
        )
        .unwrap())
        .unwrap();
        race.add_state(sleeper("slow", 10_000, &ids)).unwrap();

        assert_eq!(race.run(RunContext::default()).await.id, ABORTED);
    }

    #[tokio::test]
    async fn barrier_waits_for_all_and_collects_outputs() {
        let ids = IdAllocator::sequential();
        let barrier = State::barrier_concurrency("all", &ids).unwrap();
        let barrier_id = barrier.id();
        let mut targets = Vec::new();
        for (name, delay) in [("a", 5u64), ("b", 20u64)] {
            let child = State::execution(
                name,
                script_fn(move |ctx: ScriptContext| async move {
                    ctx.sleep(Duration::from_millis(delay)).await;
                    ctx.set_output("value", ctx.state_name().to_string());
                    Ok::<_, ScriptError>(SUCCESS)
                }),
                &ids,
            )
            .unwrap();
            let out = child.add_output_port("value", DataType::String, None, None).unwrap();
            let target = barrier
                .add_output_port(name, DataType::String, None, None)
                .unwrap();
            let child_id = barrier.add_state(child).unwrap();
            targets.push((child_id, out, target));
        }
        for (child_id, out, target) in &targets {
            barrier
                .add_data_flow(child_id, *out, &barrier_id, *target)
                .unwrap();
        }

        let outcome = barrier.run(RunContext::default()).await;
        assert_eq!(outcome.id, SUCCESS);
        let output = barrier.runtime_output();
        assert_eq!(output.get("a"), Some(&json!("a")));
        assert_eq!(output.get("b"), Some(&json!("b")));
        assert_eq!(barrier.history().steps().len(), 2);
    }

    #[tokio::test]
    async fn barrier_aborts_if_any_child_aborts() {
        let ids = IdAllocator::sequential();
        let barrier = State::barrier_concurrency("all", &ids).unwrap();
        barrier.add_state(sleeper("ok", 1, &ids)).unwrap();
        barrier
            .add_state(
                State::execution(
                    "bad",
                    script_fn(|_ctx: ScriptContext| async move { Err(ScriptError::failed("x")) }),
                    &ids,
                )
                .unwrap(),
            )
            .unwrap();

        assert_eq!(barrier.run(RunContext::default()).await.id, ABORTED);
    }

    #[tokio::test]
    async fn preempting_barrier_reaches_children() {
        let ids = IdAllocator::sequential();
        let barrier = State::barrier_concurrency("all", &ids).unwrap();
        let a = sleeper("a", 10_000, &ids);
        let b = sleeper("b", 10_000, &ids);
        barrier.add_state(Arc::clone(&a)).unwrap();
        barrier.add_state(Arc::clone(&b)).unwrap();

        let ctx = RunContext::default();
        let token = ctx.token().clone();
        let run = tokio::spawn({
            let barrier = Arc::clone(&barrier);
            async move { barrier.run(ctx).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        assert_eq!(run.await.unwrap().id, PREEMPTED);
        assert_eq!(a.final_outcome().unwrap().id, PREEMPTED);
        assert_eq!(b.final_outcome().unwrap().id, PREEMPTED);
    }

    #[tokio::test]
    async fn empty_barrier_succeeds() {
        let ids = IdAllocator::sequential();
        let barrier = State::barrier_concurrency("none", &ids).unwrap();
        assert_eq!(barrier.run(RunContext::default()).await.id, SUCCESS);
    }
}
