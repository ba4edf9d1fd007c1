//! Identifier allocation for states, ports, outcomes, transitions and data flows.
//!
//! The allocator is an injectable service: clone it to share one id space
//! between several trees, or create a fresh one for an isolated sequence.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of a state. Unique among the siblings of a container.
pub type StateId = String;

/// Identifier of a data port or scoped variable.
pub type PortId = u64;

/// Identifier of an outcome, unique within one state.
pub type OutcomeId = i32;

/// Identifier of a transition, unique within one container.
pub type TransitionId = u64;

/// Identifier of a data flow, unique within one container.
pub type DataFlowId = u64;

const STATE_ID_LENGTH: usize = 8;

/// How state ids are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStrategy {
    /// Short uppercase ids derived from random uuids.
    Random,
    /// Deterministic `S1`, `S2`, ... ids for reproducible tests.
    Sequential,
}

#[derive(Debug)]
struct AllocatorInner {
    strategy: IdStrategy,
    state_counter: AtomicU64,
    port_counter: AtomicU64,
    transition_counter: AtomicU64,
    data_flow_counter: AtomicU64,
    issued_state_ids: Mutex<HashSet<StateId>>,
}

/// Thread-safe id allocator.
///
/// Ids handed out by one allocator (and all of its clones) are never
/// handed out twice during the allocator's lifetime.
///
/// # Example
///
/// ```rust
/// use statecraft::core::IdAllocator;
///
/// let ids = IdAllocator::sequential();
/// assert_eq!(ids.state_id(), "S1");
/// assert_eq!(ids.state_id(), "S2");
/// assert_ne!(ids.port_id(), ids.port_id());
/// ```
#[derive(Debug, Clone)]
pub struct IdAllocator {
    inner: Arc<AllocatorInner>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    /// Create an allocator drawing random state ids.
    pub fn new() -> Self {
        Self::with_strategy(IdStrategy::Random)
    }

    /// Create an allocator drawing deterministic state ids.
    pub fn sequential() -> Self {
        Self::with_strategy(IdStrategy::Sequential)
    }

    pub fn with_strategy(strategy: IdStrategy) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                strategy,
                state_counter: AtomicU64::new(0),
                port_counter: AtomicU64::new(0),
                transition_counter: AtomicU64::new(0),
                data_flow_counter: AtomicU64::new(0),
                issued_state_ids: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn strategy(&self) -> IdStrategy {
        self.inner.strategy
    }

    /// Draw a fresh state id.
    pub fn state_id(&self) -> StateId {
        match self.inner.strategy {
            IdStrategy::Sequential => {
                let n = self.inner.state_counter.fetch_add(1, Ordering::Relaxed) + 1;
                let id = format!("S{n}");
                self.inner.issued_state_ids.lock().insert(id.clone());
                id
            }
            IdStrategy::Random => {
                let mut issued = self.inner.issued_state_ids.lock();
                loop {
                    let candidate = random_state_id();
                    if issued.insert(candidate.clone()) {
                        return candidate;
                    }
                }
            }
        }
    }

    /// Mark an externally supplied state id as used so it is never drawn.
    pub fn reserve_state_id(&self, id: &str) {
        self.inner.issued_state_ids.lock().insert(id.to_string());
    }

    pub fn port_id(&self) -> PortId {
        self.inner.port_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Make sure the port counter never hands out `id` or anything below it.
    pub fn reserve_port_id(&self, id: PortId) {
        self.inner.port_counter.fetch_max(id, Ordering::Relaxed);
    }

    pub fn transition_id(&self) -> TransitionId {
        self.inner.transition_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reserve_transition_id(&self, id: TransitionId) {
        self.inner.transition_counter.fetch_max(id, Ordering::Relaxed);
    }

    pub fn data_flow_id(&self) -> DataFlowId {
        self.inner.data_flow_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reserve_data_flow_id(&self, id: DataFlowId) {
        self.inner.data_flow_counter.fetch_max(id, Ordering::Relaxed);
    }

    /// Smallest positive outcome id not contained in `used`.
    pub fn outcome_id<'a, I>(&self, used: I) -> OutcomeId
    where
        I: IntoIterator<Item = &'a OutcomeId>,
    {
        let used: HashSet<OutcomeId> = used.into_iter().copied().collect();
        (1..)
            .find(|candidate| !used.contains(candidate))
            .unwrap_or(OutcomeId::MAX)
    }
}

fn random_state_id() -> StateId {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(STATE_ID_LENGTH)
        .map(|byte| char::from(b'A' + byte % 26))
        .collect()
}
