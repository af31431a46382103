//! Plan data model: task DAGs bound to a context ref and capability map.
//!
//! A [`Plan`] is the contract between planner and runtime: a set of
//! [`TaskSpec`]s, the guarded [`Edge`]s between them, the
//! `context_ref` digest of the packet it was planned against, and the
//! capability-map version it targets. [`Plan::validate_structure`] enforces
//! the referential-integrity rules before anything executes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Retry specification
// ---------------------------------------------------------------------------

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Constant delay of `base_ms` between attempts.
    Fixed,
    /// `base_ms * 2^(attempt-1)` between attempts.
    #[default]
    Exp,
}

/// Per-task retry contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    /// Total attempts including the first.
    pub attempts: u32,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: Backoff,
    /// Base delay in milliseconds.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    /// Whether to multiply each delay by uniform(0.5, 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_base_ms() -> u64 {
    1000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::Exp,
            base_ms: default_base_ms(),
            jitter: default_jitter(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks and edges
// ---------------------------------------------------------------------------

/// A single unit of work inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Unique id within the plan.
    pub id: String,
    /// Name of the registered capability this task targets.
    pub capability_ref: String,
    /// Input value handed to the task handler.
    #[serde(default)]
    pub input: Value,
    /// Explicit retry contract. Takes precedence over `retry_policy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    /// Named retry policy; resolved to the run's default retry contract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<String>,
    /// Guard expressions evaluated against the task output after execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification: Vec<String>,
    /// Additional tools this task may use, beyond the run-level allowance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    /// Short human-readable title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// What the task is trying to achieve; feeds nucleus prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    /// How success will be judged; feeds nucleus prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,
}

impl TaskSpec {
    /// Minimal task targeting a capability.
    pub fn new(id: impl Into<String>, capability_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability_ref: capability_ref.into(),
            input: Value::Null,
            retry: None,
            retry_policy: None,
            verification: Vec::new(),
            tools: Vec::new(),
            title: None,
            objective: None,
            success_criteria: None,
        }
    }

    /// Set the task input, builder style.
    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Set the retry contract, builder style.
    #[must_use]
    pub fn with_retry(mut self, retry: RetrySpec) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Add a verification expression, builder style.
    #[must_use]
    pub fn with_verification(mut self, expr: impl Into<String>) -> Self {
        self.verification.push(expr.into());
        self
    }

    /// Set the objective, builder style.
    #[must_use]
    pub fn with_objective(mut self, objective: impl Into<String>) -> Self {
        self.objective = Some(objective.into());
        self
    }

    /// Allow an extra tool, builder style.
    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    /// Default idempotency key for side-effectful tool calls issued by
    /// this task: stable across a resume of the same plan.
    pub fn idem_key(&self, context_ref: &str) -> String {
        let input_digest = crate::digest::digest_value(&self.input);
        let head = context_ref.get(..12).unwrap_or(context_ref);
        let tail = input_digest.get(..12).unwrap_or(&input_digest);
        format!("{head}-{}-{tail}", self.id)
    }
}

/// How a task failure propagates along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeErrorMode {
    /// The downstream failure is retryable per the task's retry contract.
    Retryable,
    /// The failure aborts the run.
    Fatal,
    /// A compensation branch should fire. Recorded in the ledger and
    /// treated as fatal until compensation routing lands.
    CompensationRequired,
}

/// A directed, optionally guarded dependency between two tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Upstream task id.
    pub from: String,
    /// Downstream task id.
    pub to: String,
    /// Boolean guard over `{context, outputs, policy}`; absent means
    /// unconditionally traversable once `from` has executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    /// Failure routing for the downstream task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<EdgeErrorMode>,
}

impl Edge {
    /// Unguarded edge.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: None,
            on_error: None,
        }
    }

    /// Attach a guard expression, builder style.
    #[must_use]
    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    /// Attach an error mode, builder style.
    #[must_use]
    pub fn with_on_error(mut self, mode: EdgeErrorMode) -> Self {
        self.on_error = Some(mode);
        self
    }

    /// Display form used in ledger entries: `from->to`.
    pub fn label(&self) -> String {
        format!("{}->{}", self.from, self.to)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Plan integrity violations.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Two tasks share an id.
    #[error("duplicate task id {0:?}")]
    DuplicateTask(String),
    /// An edge references a task that is not in the plan.
    #[error("edge {edge:?} references unknown task {task:?}")]
    UnknownTask {
        /// Edge label `from->to`.
        edge: String,
        /// The missing endpoint.
        task: String,
    },
    /// The task graph contains a cycle.
    #[error("plan contains a cycle through tasks {0:?}")]
    Cycle(Vec<String>),
    /// A task targets a capability missing from the registry.
    #[error("task {task:?} targets unknown capability {capability:?}")]
    UnknownCapability {
        /// Offending task id.
        task: String,
        /// The unresolved capability name.
        capability: String,
    },
    /// The plan was produced against a different capability-map version.
    #[error("plan targets capability map {plan:?} but registry is at {registry:?}")]
    CapabilityMapVersion {
        /// Version stamped on the plan.
        plan: String,
        /// Version of the live registry.
        registry: String,
    },
    /// The plan was produced against a different context packet.
    #[error("plan context ref {plan} does not match packet ref {packet}")]
    ContextRefMismatch {
        /// Ref stamped on the plan.
        plan: String,
        /// Ref of the packet handed to the runtime.
        packet: String,
    },
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A task DAG bound to a context packet and a capability-map version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Plan identifier.
    pub id: String,
    /// Digest of the context packet this plan was produced against.
    #[serde(default)]
    pub context_ref: String,
    /// Capability-map version this plan targets.
    #[serde(default)]
    pub capability_map_version: String,
    /// Tasks in declared order; ties in the ready set resolve by this order.
    pub tasks: Vec<TaskSpec>,
    /// Guarded dependencies.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Planner rationale for this candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl Plan {
    /// Build an empty plan with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context_ref: String::new(),
            capability_map_version: String::new(),
            tasks: Vec::new(),
            edges: Vec::new(),
            rationale: None,
        }
    }

    /// Append a task, builder style.
    #[must_use]
    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    /// Append an edge, builder style.
    #[must_use]
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Task ids in declared order.
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    /// Look up a task by id.
    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// All edges whose `to` endpoint is `task_id`.
    pub fn incoming_edges(&self, task_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.to == task_id).collect()
    }

    /// Enforce structural integrity: unique task ids, edge endpoints
    /// resolve, no cycles.
    ///
    /// # Errors
    ///
    /// Returns the first [`PlanError`] found.
    pub fn validate_structure(&self) -> Result<(), PlanError> {
        let mut ids = BTreeSet::new();
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(PlanError::DuplicateTask(task.id.clone()));
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(PlanError::UnknownTask {
                        edge: edge.label(),
                        task: endpoint.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm; leftover nodes after peeling are the cycle.
    fn check_acyclic(&self) -> Result<(), PlanError> {
        let mut indegree: BTreeMap<&str, usize> =
            self.tasks.iter().map(|t| (t.id.as_str(), 0)).collect();
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in &self.edges {
            adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
            if let Some(count) = indegree.get_mut(edge.to.as_str()) {
                *count = count.saturating_add(1);
            }
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut peeled = 0usize;
        while let Some(id) = queue.pop_front() {
            peeled = peeled.saturating_add(1);
            for &next in adjacency.get(id).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(next) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if peeled < self.tasks.len() {
            let mut remaining: Vec<String> = indegree
                .iter()
                .filter(|(_, &count)| count > 0)
                .map(|(&id, _)| id.to_owned())
                .collect();
            remaining.sort();
            return Err(PlanError::Cycle(remaining));
        }
        Ok(())
    }

    /// Enforce that the plan matches the packet it is about to run against.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::ContextRefMismatch`] when the stamped ref
    /// differs from the packet's.
    pub fn validate_context(&self, packet_ref: &str) -> Result<(), PlanError> {
        if self.context_ref != packet_ref {
            return Err(PlanError::ContextRefMismatch {
                plan: self.context_ref.clone(),
                packet: packet_ref.to_owned(),
            });
        }
        Ok(())
    }
}
