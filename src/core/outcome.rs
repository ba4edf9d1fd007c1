//! Outcomes: named exit conditions of a state.

use super::ids::OutcomeId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Default success outcome registered on every new state.
pub const SUCCESS: OutcomeId = 0;
/// Terminal outcome signalling failure. Always present.
pub const ABORTED: OutcomeId = -1;
/// Terminal outcome signalling cooperative cancellation. Always present.
pub const PREEMPTED: OutcomeId = -2;

pub const SUCCESS_NAME: &str = "success";
pub const ABORTED_NAME: &str = "aborted";
pub const PREEMPTED_NAME: &str = "preempted";

/// Named exit condition of a state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outcome {
    pub id: OutcomeId,
    pub name: String,
}

impl Outcome {
    pub fn new(id: OutcomeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(SUCCESS, SUCCESS_NAME)
    }

    pub fn aborted() -> Self {
        Self::new(ABORTED, ABORTED_NAME)
    }

    pub fn preempted() -> Self {
        Self::new(PREEMPTED, PREEMPTED_NAME)
    }

    /// Terminal outcomes can never be removed from a state.
    pub fn is_terminal(&self) -> bool {
        is_terminal_id(self.id)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

pub fn is_terminal_id(id: OutcomeId) -> bool {
    id == ABORTED || id == PREEMPTED
}

/// Pick a name for an outcome that does not collide with `taken`.
///
/// `taken` holds the names of the *other* outcomes of the state. If
/// `proposed` is among them, the smallest positive integer suffix that
/// yields an unused name is appended.
pub fn unique_outcome_name<'a, I>(proposed: &str, taken: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let taken: HashSet<&str> = taken.into_iter().collect();
    if !taken.contains(proposed) {
        return proposed.to_string();
    }
    (1u64..)
        .map(|suffix| format!("{proposed}{suffix}"))
        .find(|candidate| !taken.contains(candidate.as_str()))
        .unwrap_or_else(|| proposed.to_string())
}
