//! Shared core types: goals and run metrics.
//!
//! Larger aggregates live in their own modules ([`crate::plan`],
//! [`crate::context`], [`crate::ledger`]); this module holds the small
//! caller-facing types that cross every seam.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A high-level objective submitted by the caller.
///
/// Immutable for the duration of a run. The kernel facade assigns a fresh
/// UUID when `id` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    /// Stable goal identifier.
    #[serde(default)]
    pub id: String,
    /// What the caller wants accomplished, in natural language.
    pub intent: String,
    /// Hard constraints the planner and runtime must respect.
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl Goal {
    /// Build a goal from an intent string with a generated id.
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            intent: intent.into(),
            constraints: Vec::new(),
        }
    }

    /// Add a constraint, builder style.
    #[must_use]
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Assign a fresh UUID if the id is empty. Returns whether it changed.
    pub fn normalize_id(&mut self) -> bool {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
            return true;
        }
        false
    }
}

/// Aggregate counters for a single run, finalized at termination and
/// restored as a baseline when resuming from a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Tasks that reached `TASK_END`.
    pub tasks_executed: u64,
    /// Tool calls issued through ledgered wrappers.
    pub tool_calls: u64,
    /// Nucleus inference rounds across all tasks.
    pub nucleus_rounds: u64,
    /// Wall-clock seconds spent executing (cumulative across resumes).
    pub elapsed_secs: f64,
}

impl RunMetrics {
    /// Fold another metrics snapshot into this one.
    pub fn absorb(&mut self, other: &RunMetrics) {
        self.tasks_executed = self.tasks_executed.saturating_add(other.tasks_executed);
        self.tool_calls = self.tool_calls.saturating_add(other.tool_calls);
        self.nucleus_rounds = self.nucleus_rounds.saturating_add(other.nucleus_rounds);
        self.elapsed_secs += other.elapsed_secs;
    }
}
