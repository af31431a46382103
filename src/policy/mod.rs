//! Policy engine seam.
//!
//! The runtime consults the configured [`PolicyEngine`] before and after
//! every task (`task.pre`, `task.post`) and the facade consults it at plan
//! admission (`plan.admit`). A denial is fatal and ledgered with its
//! reason. Two implementations ship: [`AllowAllPolicy`] (the default) and
//! [`RulePolicy`], a static allow/deny table for tests and embedding.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Policy action evaluated before a task runs.
pub const ACTION_TASK_PRE: &str = "task.pre";
/// Policy action evaluated after a task produced output.
pub const ACTION_TASK_POST: &str = "task.post";
/// Policy action evaluated when a plan is admitted for execution.
pub const ACTION_PLAN_ADMIT: &str = "plan.admit";

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    /// Whether the action may proceed.
    pub allow: bool,
    /// Optional limits the engine imposes (advisory; recorded verbatim).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Value>,
    /// Why the decision was made; required reading on denial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyDecision {
    /// An unconditional allow.
    pub fn allow() -> Self {
        Self {
            allow: true,
            limits: None,
            reason: None,
        }
    }

    /// A denial with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            limits: None,
            reason: Some(reason.into()),
        }
    }
}

/// The policy evaluation seam.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluate `action` (`plan.admit`, `task.pre`, `task.post`) against
    /// its payload.
    async fn evaluate(&self, action: &str, payload: Value) -> PolicyDecision;
}

/// Permits everything. The default when no engine is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyEngine for AllowAllPolicy {
    async fn evaluate(&self, _action: &str, _payload: Value) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

/// A static rule table: deny listed `(action, task_id)` pairs, allow the
/// rest. Task ids are read from the payload's `taskId` field.
#[derive(Debug, Clone, Default)]
pub struct RulePolicy {
    denials: HashMap<(String, String), String>,
}

impl RulePolicy {
    /// An empty (allow-everything) table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny `task_id` at `action` with the given reason, builder style.
    #[must_use]
    pub fn deny(
        mut self,
        action: impl Into<String>,
        task_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        self.denials
            .insert((action.into(), task_id.into()), reason.into());
        self
    }
}

#[async_trait]
impl PolicyEngine for RulePolicy {
    async fn evaluate(&self, action: &str, payload: Value) -> PolicyDecision {
        let task_id = payload
            .get("taskId")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match self.denials.get(&(action.to_owned(), task_id.to_owned())) {
            Some(reason) => PolicyDecision::deny(reason.clone()),
            None => PolicyDecision::allow(),
        }
    }
}
