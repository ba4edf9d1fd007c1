//! Execution history of a container run.
//!
//! A container records one [`ExecutionStep`] per finished child, in the
//! order the children completed. The history of the last run stays
//! available after the run ends.

use super::ids::StateId;
use super::outcome::Outcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A child that ran to an outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub state_id: StateId,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Ordered record of the children a container ran.
///
/// # Example
///
/// ```rust
/// use statecraft::core::{ExecutionHistory, ExecutionStep, Outcome};
/// use chrono::Utc;
///
/// let mut history = ExecutionHistory::new();
/// let now = Utc::now();
/// history.record(ExecutionStep {
///     state_id: "A".into(),
///     outcome: Outcome::success(),
///     started_at: now,
///     finished_at: now,
/// });
///
/// assert_eq!(history.visited(), vec!["A"]);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHistory {
    steps: Vec<ExecutionStep>,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn record(&mut self, step: ExecutionStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Ids of the children in completion order.
    pub fn visited(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.state_id.as_str()).collect()
    }

    /// Time from the first child start to the last child finish.
    ///
    /// Returns `None` if nothing ran.
    pub fn duration(&self) -> Option<Duration> {
        let first = self.steps.iter().map(|s| s.started_at).min()?;
        let last = self.steps.iter().map(|s| s.finished_at).max()?;
        last.signed_duration_since(first).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> ExecutionStep {
        ExecutionStep {
            state_id: id.to_string(),
            outcome: Outcome::success(),
            started_at,
            finished_at,
        }
    }

    #[test]
    fn new_history_is_empty() {
        let history = ExecutionHistory::new();
        assert!(history.is_empty());
        assert!(history.visited().is_empty());
        assert!(history.duration().is_none());
    }

    #[test]
    fn visited_keeps_completion_order() {
        let now = Utc::now();
        let mut history = ExecutionHistory::new();
        history.record(step("B", now, now));
        history.record(step("A", now, now));
        assert_eq!(history.visited(), vec!["B", "A"]);
    }

    #[test]
    fn duration_spans_first_start_to_last_finish() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(25);
        let mut history = ExecutionHistory::new();
        history.record(step("A", start, start));
        history.record(step("B", start, end));

        assert_eq!(history.duration(), Some(Duration::from_millis(25)));
    }

    #[test]
    fn history_serializes_correctly() {
        let now = Utc::now();
        let mut history = ExecutionHistory::new();
        history.record(step("A", now, now));

        let json = serde_json::to_string(&history).unwrap();
        let restored: ExecutionHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(history, restored);
    }
}
