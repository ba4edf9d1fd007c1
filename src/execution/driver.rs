//! Starting, stopping and joining runs.

use super::context::{ExecutionConfig, RunContext};
use crate::core::{Outcome, State, StateError, StateId};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors from driving a run.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("State machine '{0}' is already running")]
    AlreadyRunning(StateId),

    #[error("State machine '{0}' has not been started")]
    NotStarted(StateId),

    #[error("Run of '{state_id}' failed: {message}")]
    Join { state_id: StateId, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(#[from] StateError),
}

/// A run on its own tokio task.
#[derive(Debug)]
pub struct ExecutionHandle {
    state_id: StateId,
    token: CancellationToken,
    handle: JoinHandle<Outcome>,
}

impl ExecutionHandle {
    pub fn state_id(&self) -> &str {
        &self.state_id
    }

    /// Ask the run to stop. Already finished runs are unaffected.
    pub fn stop(&self) {
        info!(state_id = %self.state_id, "stopping run");
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run to finish.
    pub async fn join(self) -> Result<Outcome, ExecutionError> {
        self.handle.await.map_err(|err| ExecutionError::Join {
            state_id: self.state_id,
            message: err.to_string(),
        })
    }
}

impl State {
    /// Run this state on a new tokio task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>, ctx: RunContext) -> ExecutionHandle {
        let token = ctx.token().clone();
        ExecutionHandle {
            state_id: self.id(),
            token,
            handle: tokio::spawn(self.run(ctx)),
        }
    }
}

/// Owner of a root state that runs it at most once at a time.
///
/// # Example
///
/// ```rust
/// use statecraft::core::{IdAllocator, State, SUCCESS};
/// use statecraft::execution::{EmptyScript, ExecutionConfig, StateMachineExecutor};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let ids = IdAllocator::new();
/// let root = State::execution("hello", Arc::new(EmptyScript), &ids).unwrap();
/// let executor = StateMachineExecutor::new(root, ExecutionConfig::default());
///
/// let outcome = executor.run_to_completion(None).await.unwrap();
/// assert_eq!(outcome.id, SUCCESS);
/// # }
/// ```
#[derive(Debug)]
pub struct StateMachineExecutor {
    root: Arc<State>,
    context: RunContext,
    current: Mutex<Option<ExecutionHandle>>,
}

impl StateMachineExecutor {
    pub fn new(root: Arc<State>, config: ExecutionConfig) -> Self {
        Self {
            root,
            context: RunContext::new(config),
            current: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Arc<State> {
        &self.root
    }

    pub fn config(&self) -> &ExecutionConfig {
        self.context.config()
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start running the root. Fails if a previous run is still going.
    pub fn start(&self) -> Result<(), ExecutionError> {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!(state_id = %self.root.id(), "start requested while running");
            return Err(ExecutionError::AlreadyRunning(self.root.id()));
        }
        let ctx = self.context.detached();
        info!(state_id = %self.root.id(), "starting state machine");
        *current = Some(self.root.start(ctx));
        Ok(())
    }

    /// Preempt the current run.
    pub fn stop(&self) -> Result<(), ExecutionError> {
        match self.current.lock().as_ref() {
            Some(handle) => {
                handle.stop();
                Ok(())
            }
            None => Err(ExecutionError::NotStarted(self.root.id())),
        }
    }

    /// Wait for the current run and return its outcome.
    pub async fn join(&self) -> Result<Outcome, ExecutionError> {
        let handle = self
            .current
            .lock()
            .take()
            .ok_or_else(|| ExecutionError::NotStarted(self.root.id()))?;
        let outcome = handle.join().await?;
        info!(state_id = %self.root.id(), outcome = %outcome, "state machine finished");
        Ok(outcome)
    }

    /// Set the root's input (an object, when given), run it and wait.
    pub async fn run_to_completion(&self, input: Option<Value>) -> Result<Outcome, ExecutionError> {
        if let Some(input) = input {
            self.root.set_runtime_input_value(input)?;
        }
        self.start()?;
        self.join().await
    }
}
