//! Bodies of execution states.
//!
//! A [`Script`] receives a [`ScriptContext`] with the state's input values,
//! writes output values into it and returns the id of the outcome it
//! selected. Long running scripts should watch
//! [`ScriptContext::is_preempted`] or await [`ScriptContext::preempted`] and
//! return early when asked to stop.
//!
//! # Example
//!
//! ```rust
//! use statecraft::execution::{script_fn, ScriptContext, ScriptError};
//! use statecraft::core::SUCCESS;
//! use serde_json::json;
//!
//! let double = script_fn(|ctx: ScriptContext| async move {
//!     let n: i64 = ctx.input_as("n")?;
//!     ctx.set_output("doubled", json!(n * 2));
//!     Ok::<_, ScriptError>(SUCCESS)
//! });
//! # let _ = double;
//! ```

use crate::core::{OutcomeId, StateId, SUCCESS};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure reported by a script body. Any error resolves the state to
/// `aborted`.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("missing input '{0}'")]
    MissingInput(String),

    #[error("input '{name}' has an unexpected shape: {source}")]
    InvalidInput {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Failed(String),
}

impl ScriptError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// What a script sees of the state it runs for.
#[derive(Clone, Debug)]
pub struct ScriptContext {
    state_id: StateId,
    state_name: String,
    input: Arc<BTreeMap<String, Value>>,
    output: Arc<Mutex<BTreeMap<String, Value>>>,
    token: CancellationToken,
}

impl ScriptContext {
    pub fn new(
        state_id: StateId,
        state_name: String,
        input: BTreeMap<String, Value>,
        output: BTreeMap<String, Value>,
        token: CancellationToken,
    ) -> Self {
        Self {
            state_id,
            state_name,
            input: Arc::new(input),
            output: Arc::new(Mutex::new(output)),
            token,
        }
    }

    pub fn state_id(&self) -> &str {
        &self.state_id
    }

    pub fn state_name(&self) -> &str {
        &self.state_name
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.input.get(name)
    }

    pub fn inputs(&self) -> &BTreeMap<String, Value> {
        &self.input
    }

    /// Deserialize input `name` into `T`.
    pub fn input_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, ScriptError> {
        let value = self
            .input
            .get(name)
            .ok_or_else(|| ScriptError::MissingInput(name.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|source| ScriptError::InvalidInput {
            name: name.to_string(),
            source,
        })
    }

    pub fn set_output(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.output.lock().insert(name.into(), value.into());
    }

    pub fn output(&self, name: &str) -> Option<Value> {
        self.output.lock().get(name).cloned()
    }

    pub(crate) fn take_outputs(&self) -> BTreeMap<String, Value> {
        std::mem::take(&mut *self.output.lock())
    }

    pub fn is_preempted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the state has been asked to stop.
    pub async fn preempted(&self) {
        self.token.cancelled().await
    }

    /// Sleep for `duration` unless preempted first.
    ///
    /// Returns `false` if the sleep was cut short by preemption.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.token.cancelled() => false,
        }
    }
}

/// Body of an execution state.
#[async_trait]
pub trait Script: Send + Sync {
    async fn execute(&self, ctx: ScriptContext) -> Result<OutcomeId, ScriptError>;
}

/// Script that does nothing and selects `success`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyScript;

#[async_trait]
impl Script for EmptyScript {
    async fn execute(&self, _ctx: ScriptContext) -> Result<OutcomeId, ScriptError> {
        Ok(SUCCESS)
    }
}

/// Script backed by an async closure. Built with [`script_fn`].
pub struct FnScript<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Script for FnScript<F>
where
    F: Fn(ScriptContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutcomeId, ScriptError>> + Send + 'static,
{
    async fn execute(&self, ctx: ScriptContext) -> Result<OutcomeId, ScriptError> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a shareable script.
pub fn script_fn<F, Fut>(f: F) -> Arc<dyn Script>
where
    F: Fn(ScriptContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutcomeId, ScriptError>> + Send + 'static,
{
    Arc::new(FnScript { f })
}
