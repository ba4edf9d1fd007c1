//! Scripts looked up by key while decoding.

use crate::execution::Script;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Scripts available to decoded execution states, by key.
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: HashMap<String, Arc<dyn Script>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `script` under `key`, returning the registry for chaining.
    pub fn with(mut self, key: impl Into<String>, script: Arc<dyn Script>) -> Self {
        self.insert(key, script);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, script: Arc<dyn Script>) {
        self.scripts.insert(key.into(), script);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Script>> {
        self.scripts.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.scripts.keys().collect();
        keys.sort();
        f.debug_struct("ScriptRegistry").field("keys", &keys).finish()
    }
}
