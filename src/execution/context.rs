//! Configuration and per-run context handed down the tree.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Host-provided execution settings.
///
/// # Example
///
/// ```rust
/// use statecraft::execution::ExecutionConfig;
///
/// let config: ExecutionConfig =
///     serde_json::from_str(r#"{ "max_parallel_scripts": 4 }"#).unwrap();
/// assert!(config.type_checking);
/// assert_eq!(config.max_parallel_scripts, Some(4));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Check runtime data against port types before and after each script.
    pub type_checking: bool,
    /// Upper bound on script bodies running at the same time.
    pub max_parallel_scripts: Option<usize>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            type_checking: true,
            max_parallel_scripts: None,
        }
    }
}

/// Everything a state needs to run: its preemption token, the
/// configuration and the shared script limiter.
#[derive(Debug, Clone)]
pub struct RunContext {
    token: CancellationToken,
    config: Arc<ExecutionConfig>,
    limiter: Option<Arc<Semaphore>>,
}

impl RunContext {
    pub fn new(config: ExecutionConfig) -> Self {
        let limiter = config
            .max_parallel_scripts
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));
        Self {
            token: CancellationToken::new(),
            config: Arc::new(config),
            limiter,
        }
    }

    /// Run under `token` instead of a fresh one.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn is_preempted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Context for a nested run: same configuration and limiter, child token.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            config: Arc::clone(&self.config),
            limiter: self.limiter.clone(),
        }
    }

    /// Context for an independent run sharing configuration and limiter.
    pub fn detached(&self) -> Self {
        Self {
            token: CancellationToken::new(),
            config: Arc::clone(&self.config),
            limiter: self.limiter.clone(),
        }
    }

    /// Wait for a script slot. `Ok(None)` when parallelism is unbounded,
    /// `Err(())` if preempted while waiting.
    pub(crate) async fn acquire_permit(&self) -> Result<Option<OwnedSemaphorePermit>, ()> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };
        tokio::select! {
            permit = Arc::clone(limiter).acquire_owned() => Ok(permit.ok()),
            _ = self.token.cancelled() => Err(()),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(ExecutionConfig::default())
    }
}
