//! Library states: reusable state machines referenced by name.
//!
//! A library state resolves a [`LibraryReference`] to a template once, at
//! construction, and keeps a private deep copy of it. Its ports and outcomes
//! mirror those of the copy's root, so callers wire a library state exactly
//! like the template.

use super::error::StateError;
use super::ids::{IdAllocator, StateId};
use super::state::{Body, State, StateData, StateKind};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of a library template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LibraryReference {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl LibraryReference {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for LibraryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.name, self.version)
    }
}

/// Source of library templates.
pub trait LibraryResolver: Send + Sync {
    /// Return the template for `reference`, or
    /// [`StateError::LibraryNotFound`].
    fn resolve(&self, reference: &LibraryReference) -> Result<Arc<State>, StateError>;
}

/// Catalog of templates held in memory.
#[derive(Default)]
pub struct InMemoryLibrary {
    templates: RwLock<HashMap<LibraryReference, Arc<State>>>,
}

impl InMemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `template` under `reference`, replacing any previous entry.
    pub fn register(&self, reference: LibraryReference, template: Arc<State>) {
        debug!(library = %reference, template = %template.id(), "library registered");
        self.templates.write().insert(reference, template);
    }

    pub fn unregister(&self, reference: &LibraryReference) -> Option<Arc<State>> {
        self.templates.write().remove(reference)
    }

    pub fn contains(&self, reference: &LibraryReference) -> bool {
        self.templates.read().contains_key(reference)
    }

    /// Registered references, sorted.
    pub fn references(&self) -> Vec<LibraryReference> {
        let mut references: Vec<_> = self.templates.read().keys().cloned().collect();
        references.sort();
        references
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }
}

impl LibraryResolver for InMemoryLibrary {
    fn resolve(&self, reference: &LibraryReference) -> Result<Arc<State>, StateError> {
        self.templates
            .read()
            .get(reference)
            .cloned()
            .ok_or_else(|| StateError::LibraryNotFound(reference.clone()))
    }
}

impl fmt::Debug for InMemoryLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryLibrary")
            .field("references", &self.references())
            .finish()
    }
}

pub(crate) struct LibraryData {
    pub(crate) reference: LibraryReference,
    pub(crate) state_copy: Arc<State>,
}

impl State {
    /// Create a library state for `reference`.
    ///
    /// Fails with [`StateError::LibraryNotFound`] when the resolver does not
    /// know the reference; nothing is created in that case.
    pub fn library(
        name: impl Into<String>,
        reference: LibraryReference,
        resolver: &dyn LibraryResolver,
        allocator: &IdAllocator,
    ) -> Result<Arc<State>, StateError> {
        Self::library_with_id(None, name, reference, resolver, allocator)
    }

    pub(crate) fn library_with_id(
        id: Option<StateId>,
        name: impl Into<String>,
        reference: LibraryReference,
        resolver: &dyn LibraryResolver,
        allocator: &IdAllocator,
    ) -> Result<Arc<State>, StateError> {
        let name = name.into();
        if name.is_empty() {
            return Err(StateError::EmptyName);
        }
        let template = resolver.resolve(&reference).inspect_err(|_| {
            warn!(library = %reference, "library could not be resolved");
        })?;
        let copy = template.duplicate();
        Ok(Self::library_from_copy(id, name, reference, copy, allocator))
    }

    /// Wrap an already built copy, mirroring its interface.
    pub(crate) fn library_from_copy(
        id: Option<StateId>,
        name: String,
        reference: LibraryReference,
        copy: Arc<State>,
        allocator: &IdAllocator,
    ) -> Arc<State> {
        let id = id.unwrap_or_else(|| allocator.state_id());
        let mut data = StateData::new(
            id,
            name,
            Body::Library(LibraryData {
                reference: reference.clone(),
                state_copy: Arc::clone(&copy),
            }),
        );
        {
            let template = copy.data.read();
            data.input_ports = template.input_ports.clone();
            data.output_ports = template.output_ports.clone();
            data.outcomes = template.outcomes.clone();
        }
        let state = State::from_parts(StateKind::Library, data, allocator.clone());
        state.adopt_children();
        debug!(state_id = %state.id(), library = %reference, "library state created");
        state
    }

    pub fn library_reference(&self) -> Option<LibraryReference> {
        match &self.data.read().body {
            Body::Library(library) => Some(library.reference.clone()),
            _ => None,
        }
    }

    /// The private copy a library state runs.
    pub fn library_copy(&self) -> Option<Arc<State>> {
        match &self.data.read().body {
            Body::Library(library) => Some(Arc::clone(&library.state_copy)),
            _ => None,
        }
    }
}
