//! Running state trees.
//!
//! [`State::run`] executes a state and everything below it and resolves to
//! the state's final outcome. Hierarchy children run inline on the caller's
//! task; concurrency children each get their own tokio task. Preemption is a
//! tree of cancellation tokens: every nested run gets a child of its parent's
//! token, so stopping a state reaches all of its descendants.
//!
//! # Example
//!
//! ```rust
//! use statecraft::core::{IdAllocator, State, SUCCESS};
//! use statecraft::execution::{EmptyScript, RunContext};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let ids = IdAllocator::new();
//! let root = State::hierarchy("root", &ids).unwrap();
//! let a = root.add_state(State::execution("A", Arc::new(EmptyScript), &ids).unwrap()).unwrap();
//! root.add_transition(&a, SUCCESS, &root.id(), Some(SUCCESS)).unwrap();
//!
//! let outcome = root.run(RunContext::default()).await;
//! assert_eq!(outcome.id, SUCCESS);
//! # }
//! ```

mod concurrency;
mod context;
mod driver;
mod hierarchy;
mod leaf;
mod library;
mod routing;
mod script;

pub use context::{ExecutionConfig, RunContext};
pub use driver::{ExecutionError, ExecutionHandle, StateMachineExecutor};
pub use script::{script_fn, EmptyScript, FnScript, Script, ScriptContext, ScriptError};

use crate::core::{Outcome, State, StateKind};
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

impl State {
    /// Run this state to an outcome.
    ///
    /// The state is active while the returned future runs. Its final outcome
    /// is also stored and available through [`State::final_outcome`].
    pub fn run(self: &Arc<Self>, ctx: RunContext) -> BoxFuture<'static, Outcome> {
        let state = Arc::clone(self);
        let span = info_span!("state", state_id = %state.id(), kind = %state.kind());
        async move {
            state.begin_run(ctx.token());
            info!(path = %state.path(), name = %state.name(), "state started");
            let outcome = match state.kind() {
                StateKind::Execution => leaf::run(Arc::clone(&state), ctx).await,
                StateKind::Hierarchy => hierarchy::run(Arc::clone(&state), ctx).await,
                StateKind::PreemptiveConcurrency => {
                    concurrency::run_preemptive(Arc::clone(&state), ctx).await
                }
                StateKind::BarrierConcurrency => {
                    concurrency::run_barrier(Arc::clone(&state), ctx).await
                }
                StateKind::Library => library::run(Arc::clone(&state), ctx).await,
            };
            info!(outcome = %outcome, "state finished");
            state.finish_run(outcome)
        }
        .instrument(span)
        .boxed()
    }
}
