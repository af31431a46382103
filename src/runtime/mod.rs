//! DAG scheduler / resumable runtime.
//!
//! [`Scheduler::run`] executes a validated [`Plan`] one ready task at a
//! time: topological readiness with guard evaluation, optional task-scope
//! filtering with early break, policy gates, bounded retries,
//! verification, nucleus preflight/postcheck hooks, and checkpointing
//! after every `checkpoint_interval` completed tasks plus before any error
//! surfaces. A failed run resumes from its checkpoint with outputs,
//! executed set, ledger, and metrics restored.
//!
//! Execution is sequential and cooperative. The invariants a concurrent
//! ready-set executor would have to preserve are already honored here:
//! `outputs` is write-once per task id, `executed` grows only after
//! `TASK_END` is appended, ledger appends are strictly serial, the packet
//! is read-only, and checkpoints snapshot `{outputs, executed, ledger}`
//! consistently between tasks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityRegistry, TaskHandler};
use crate::checkpoint::{Checkpoint, CheckpointState, CheckpointStore};
use crate::context::{ContextPacket, ContextProvider, InternalScope};
use crate::guard::{self, GuardBindings};
use crate::ledger::{EntryType, Ledger};
use crate::nucleus::{NucleusConfig, NucleusFactory, PostcheckOutcome, PreflightOutcome};
use crate::plan::{EdgeErrorMode, Plan, RetrySpec, TaskSpec};
use crate::policy::{PolicyEngine, ACTION_TASK_POST, ACTION_TASK_PRE};
use crate::providers::LlmProvider;
use crate::stream::{NullSink, StreamSink};
use crate::tools::ToolRegistry;
use crate::types::{Goal, RunMetrics};

pub mod context;
pub mod retry;
pub mod verify;

use context::{RunContext, SharedOutputs};
use verify::{GuardVerifier, Verifier};

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Where in the pipeline a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// Plan/registry/checkpoint wiring was wrong before any task ran.
    Configuration,
    /// Checkpoint restore failed or the plan drifted structurally.
    Resume,
    /// Nucleus preflight failed outright.
    Preflight,
    /// Context was still insufficient after the one retrieval round.
    ContextRetrieval,
    /// Policy denied `task.pre`.
    PolicyPre,
    /// The task body failed past its retry budget.
    Execute,
    /// Policy denied `task.post`.
    PolicyPost,
    /// A verification expression evaluated false.
    Verification,
    /// Nucleus postcheck demanded compensation or escalation.
    Postcheck,
    /// The run was cancelled.
    Cancelled,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Configuration => "configuration",
            Self::Resume => "resume",
            Self::Preflight => "preflight",
            Self::ContextRetrieval => "context_retrieval",
            Self::PolicyPre => "policy_pre",
            Self::Execute => "execute",
            Self::PolicyPost => "policy_post",
            Self::Verification => "verification",
            Self::Postcheck => "postcheck",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// The structured failure surfaced to callers: which task, which stage,
/// and the checkpoint to resume from.
#[derive(Debug, Error)]
#[error(
    "run {run_id} failed at {stage}{suffix}: {message}",
    suffix = .task_id.as_deref().map(|t| format!(" (task {t})")).unwrap_or_default()
)]
pub struct RunFailure {
    /// The failed run.
    pub run_id: String,
    /// The task being processed, when the failure is task-scoped.
    pub task_id: Option<String>,
    /// Pipeline stage that failed.
    pub stage: FailureStage,
    /// Checkpoint cut before surfacing, suitable for `resume_from`.
    pub checkpoint_id: Option<String>,
    /// Failure text.
    pub message: String,
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// A completed run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Output of every executed task.
    pub outputs_by_task: BTreeMap<String, Value>,
    /// Ids of executed tasks.
    pub executed: BTreeSet<String>,
    /// The end-of-run summary.
    pub goal_summary: String,
    /// Final metrics.
    pub metrics: RunMetrics,
    /// Most recent checkpoint, when a store was configured.
    pub last_checkpoint_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// One run's worth of wiring. Build with [`Scheduler::new`], adjust with
/// the `with_*` methods, consume with [`Scheduler::run`].
pub struct Scheduler {
    goal: Arc<Goal>,
    packet: Arc<ContextPacket>,
    plan: Plan,
    capabilities: Arc<CapabilityRegistry>,
    tools: Arc<ToolRegistry>,
    provider: Arc<dyn LlmProvider>,
    ledger: Arc<Ledger>,
    run_id: String,
    nucleus_config: NucleusConfig,
    policy: Option<Arc<dyn PolicyEngine>>,
    verifier: Arc<dyn Verifier>,
    stream: Arc<dyn StreamSink>,
    context_provider: Option<Arc<dyn ContextProvider>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    checkpoint_interval: u32,
    resume_from: Option<String>,
    task_scope: Option<BTreeSet<String>>,
    default_retry: RetrySpec,
    cancel: Option<watch::Receiver<bool>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("run_id", &self.run_id)
            .field("plan", &self.plan.id)
            .field("tasks", &self.plan.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Scheduler over the required wiring; everything optional defaults
    /// off (no policy, guard verifier, null stream, no checkpoints).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        goal: Goal,
        packet: ContextPacket,
        plan: Plan,
        capabilities: Arc<CapabilityRegistry>,
        tools: Arc<ToolRegistry>,
        provider: Arc<dyn LlmProvider>,
        ledger: Arc<Ledger>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            goal: Arc::new(goal),
            packet: Arc::new(packet),
            plan,
            capabilities,
            tools,
            provider,
            ledger,
            run_id: run_id.into(),
            nucleus_config: NucleusConfig::default(),
            policy: None,
            verifier: Arc::new(GuardVerifier),
            stream: Arc::new(NullSink),
            context_provider: None,
            checkpoint_store: None,
            checkpoint_interval: 1,
            resume_from: None,
            task_scope: None,
            default_retry: RetrySpec {
                attempts: 3,
                ..RetrySpec::default()
            },
            cancel: None,
        }
    }

    /// Set the nucleus configuration, builder style.
    #[must_use]
    pub fn with_nucleus_config(mut self, config: NucleusConfig) -> Self {
        self.nucleus_config = config;
        self
    }

    /// Attach a policy engine, builder style.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn PolicyEngine>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Replace the verifier, builder style.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Attach a stream sink, builder style.
    #[must_use]
    pub fn with_stream(mut self, stream: Arc<dyn StreamSink>) -> Self {
        self.stream = stream;
        self
    }

    /// Attach a context provider for retrieval directives, builder style.
    #[must_use]
    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context_provider = Some(provider);
        self
    }

    /// Attach a checkpoint store, builder style.
    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Checkpoint after every `interval` completed tasks, builder style.
    #[must_use]
    pub fn with_checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    /// Resume from a stored checkpoint id, builder style.
    #[must_use]
    pub fn with_resume_from(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.resume_from = Some(checkpoint_id.into());
        self
    }

    /// Restrict execution to these task ids, builder style.
    #[must_use]
    pub fn with_task_scope(mut self, scope: Vec<String>) -> Self {
        self.task_scope = Some(scope.into_iter().collect());
        self
    }

    /// Default retry contract for tasks naming a `retry_policy`,
    /// builder style.
    #[must_use]
    pub fn with_default_retry(mut self, retry: RetrySpec) -> Self {
        self.default_retry = retry;
        self
    }

    /// Attach a cancellation signal, builder style. Flipping the watch
    /// value to `true` stops the run at the next suspension point.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    // -- run ----------------------------------------------------------------

    /// Execute the plan to completion, early break, or failure.
    ///
    /// # Errors
    ///
    /// Returns [`RunFailure`] naming the task, stage, and resume
    /// checkpoint. Partial outputs survive in the checkpoint.
    pub async fn run(mut self) -> Result<ExecutionResult, RunFailure> {
        let started = Instant::now();
        let outputs: SharedOutputs = Arc::new(Mutex::new(BTreeMap::new()));
        let mut executed: BTreeSet<String> = BTreeSet::new();
        let mut base_metrics = RunMetrics::default();
        let mut policy_state = Map::new();
        let mut last_checkpoint_id: Option<String> = None;

        if let Some(resume_id) = self.resume_from.take() {
            base_metrics = self.restore(&resume_id, &outputs, &mut executed).await?;
            info!(run_id = %self.run_id, checkpoint = %resume_id, restored = executed.len(), "run resumed");
        }

        self.validate_plan()?;

        if executed.is_empty() && self.ledger.entries_by_type(EntryType::PlanSelected).is_empty() {
            self.ledger.append(
                EntryType::PlanSelected,
                json!({
                    "planId": self.plan.id,
                    "contextRef": self.plan.context_ref,
                    "capabilityMapVersion": self.plan.capability_map_version,
                    "runId": self.run_id,
                }),
            );
        }

        let factory = NucleusFactory {
            provider: Arc::clone(&self.provider),
            config: self.nucleus_config.clone(),
            ledger: Arc::clone(&self.ledger),
            packet: Arc::clone(&self.packet),
            context_provider: self.context_provider.clone(),
        };

        let mut since_checkpoint: u32 = 0;
        let mut nucleus_rounds: u64 = 0;

        loop {
            if self.cancelled() {
                let checkpoint_id = self
                    .snapshot(&outputs, &executed, base_metrics, started, nucleus_rounds)
                    .await;
                return Err(self.failure(
                    None,
                    FailureStage::Cancelled,
                    checkpoint_id,
                    "run cancelled".to_owned(),
                ));
            }

            // Early break: everything in scope is done, even if other
            // tasks are still pending.
            if let Some(scope) = &self.task_scope {
                if scope.iter().all(|id| executed.contains(id)) {
                    debug!(run_id = %self.run_id, "task scope satisfied, breaking early");
                    break;
                }
            }

            let ready = self.ready_tasks(&executed, &outputs, &policy_state);
            if ready.is_empty() {
                break;
            }

            for task_id in ready {
                if self.cancelled() {
                    let checkpoint_id = self
                        .snapshot(&outputs, &executed, base_metrics, started, nucleus_rounds)
                        .await;
                    return Err(self.failure(
                        Some(task_id),
                        FailureStage::Cancelled,
                        checkpoint_id,
                        "run cancelled".to_owned(),
                    ));
                }

                let task = match self.plan.task(&task_id) {
                    Some(task) => task.clone(),
                    None => continue,
                };

                let pipeline = self
                    .run_task(&task, &factory, &outputs, &mut policy_state)
                    .await;
                match pipeline {
                    Ok(rounds) => {
                        nucleus_rounds = nucleus_rounds.saturating_add(rounds);
                        executed.insert(task_id.clone());

                        since_checkpoint = since_checkpoint.saturating_add(1);
                        if since_checkpoint >= self.checkpoint_interval {
                            if let Some(id) = self
                                .snapshot(&outputs, &executed, base_metrics, started, nucleus_rounds)
                                .await
                            {
                                last_checkpoint_id = Some(id);
                            }
                            since_checkpoint = 0;
                        }
                    }
                    Err((stage, message, rounds)) => {
                        nucleus_rounds = nucleus_rounds.saturating_add(rounds);
                        self.ledger.append(
                            EntryType::Error,
                            json!({
                                "taskId": task_id,
                                "stage": stage.to_string(),
                                "message": message,
                            }),
                        );
                        let checkpoint_id = self
                            .snapshot(&outputs, &executed, base_metrics, started, nucleus_rounds)
                            .await;
                        return Err(self.failure(Some(task_id), stage, checkpoint_id, message));
                    }
                }
            }
        }

        // Final snapshot so a completed run can be replayed from its end
        // state.
        if since_checkpoint > 0 {
            if let Some(id) = self
                .snapshot(&outputs, &executed, base_metrics, started, nucleus_rounds)
                .await
            {
                last_checkpoint_id = Some(id);
            }
        }

        let outputs_by_task = outputs.lock().map(|m| m.clone()).unwrap_or_default();
        let goal_summary = self.goal_summary(&factory, &executed).await;
        let metrics = self.finalize_metrics(base_metrics, started, &executed, nucleus_rounds);

        info!(
            run_id = %self.run_id,
            tasks = metrics.tasks_executed,
            tool_calls = metrics.tool_calls,
            "run complete"
        );

        Ok(ExecutionResult {
            outputs_by_task,
            executed,
            goal_summary,
            metrics,
            last_checkpoint_id,
        })
    }

    // -- initialization -----------------------------------------------------

    fn validate_plan(&self) -> Result<(), RunFailure> {
        let config_failure = |message: String| RunFailure {
            run_id: self.run_id.clone(),
            task_id: None,
            stage: FailureStage::Configuration,
            checkpoint_id: None,
            message,
        };

        self.plan
            .validate_structure()
            .map_err(|e| config_failure(e.to_string()))?;
        self.plan
            .validate_context(&self.packet.context_ref())
            .map_err(|e| config_failure(e.to_string()))?;

        let registry_version = self.capabilities.version();
        if self.plan.capability_map_version != registry_version {
            return Err(config_failure(format!(
                "plan targets capability map {:?} but registry is at {registry_version:?}",
                self.plan.capability_map_version
            )));
        }

        for task in &self.plan.tasks {
            if !self.capabilities.has(&task.capability_ref) {
                return Err(config_failure(format!(
                    "task {:?} targets unknown capability {:?}",
                    task.id, task.capability_ref
                )));
            }
        }
        Ok(())
    }

    async fn restore(
        &mut self,
        resume_id: &str,
        outputs: &SharedOutputs,
        executed: &mut BTreeSet<String>,
    ) -> Result<RunMetrics, RunFailure> {
        let resume_failure = |run_id: &str, message: String| RunFailure {
            run_id: run_id.to_owned(),
            task_id: None,
            stage: FailureStage::Resume,
            checkpoint_id: None,
            message,
        };

        let store = self.checkpoint_store.as_ref().ok_or_else(|| {
            resume_failure(
                &self.run_id,
                "resume requested but no checkpoint store configured".to_owned(),
            )
        })?;

        let checkpoint = store
            .get(&self.run_id, Some(resume_id))
            .await
            .map_err(|e| resume_failure(&self.run_id, e.to_string()))?;

        // Structural drift: a resumed plan must be the same plan.
        let mut stored_ids = checkpoint.state.plan.task_ids();
        let mut current_ids = self.plan.task_ids();
        stored_ids.sort();
        current_ids.sort();
        if checkpoint.state.plan.id != self.plan.id || stored_ids != current_ids {
            return Err(resume_failure(
                &self.run_id,
                format!(
                    "plan changed structurally since checkpoint (was {:?} with {} tasks, now {:?} with {} tasks)",
                    checkpoint.state.plan.id,
                    stored_ids.len(),
                    self.plan.id,
                    current_ids.len()
                ),
            ));
        }

        if let Ok(mut map) = outputs.lock() {
            *map = checkpoint.state.outputs.clone();
        }
        *executed = checkpoint.state.executed.clone();
        self.ledger.restore(checkpoint.state.ledger.clone());
        Ok(checkpoint.state.metrics)
    }

    // -- readiness ----------------------------------------------------------

    /// Tasks whose every incoming edge has an executed source and a true
    /// guard, in plan-declared order, filtered to the task scope.
    fn ready_tasks(
        &self,
        executed: &BTreeSet<String>,
        outputs: &SharedOutputs,
        policy_state: &Map<String, Value>,
    ) -> Vec<String> {
        let bindings = self.guard_bindings(outputs, policy_state);
        let mut ready = Vec::new();

        'tasks: for task in &self.plan.tasks {
            if executed.contains(&task.id) {
                continue;
            }
            if let Some(scope) = &self.task_scope {
                if !scope.contains(&task.id) {
                    continue;
                }
            }

            let mut passed_guards = Vec::new();
            for edge in self.plan.incoming_edges(&task.id) {
                if !executed.contains(&edge.from) {
                    continue 'tasks;
                }
                if let Some(expr) = &edge.guard {
                    let result = guard::evaluate_or_false(expr, &bindings);
                    self.ledger.append(
                        EntryType::GuardEval,
                        json!({
                            "edge": edge.label(),
                            "guard": expr,
                            "result": result,
                        }),
                    );
                    if !result {
                        continue 'tasks;
                    }
                    passed_guards.push(edge.label());
                }
            }

            for edge in passed_guards {
                self.ledger
                    .append(EntryType::BranchTaken, json!({"edge": edge, "to": task.id}));
            }
            ready.push(task.id.clone());
        }
        ready
    }

    fn guard_bindings(
        &self,
        outputs: &SharedOutputs,
        policy_state: &Map<String, Value>,
    ) -> GuardBindings {
        let output_map: Map<String, Value> = outputs
            .lock()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let fact_map: Map<String, Value> = self
            .packet
            .facts
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        GuardBindings {
            context: Value::Object(fact_map),
            outputs: Value::Object(output_map),
            policy: Value::Object(policy_state.clone()),
        }
    }

    // -- per-task pipeline --------------------------------------------------

    /// Run one task through the full pipeline. Returns the nucleus rounds
    /// consumed, or `(stage, message, rounds)` on failure.
    async fn run_task(
        &self,
        task: &TaskSpec,
        factory: &NucleusFactory,
        outputs: &SharedOutputs,
        policy_state: &mut Map<String, Value>,
    ) -> Result<u64, (FailureStage, String, u64)> {
        // Resolution happens before TASK_START: a plan referencing a
        // capability that vanished is a configuration error, not a task
        // failure.
        let Some((_, handler)) = self.capabilities.resolve(&task.capability_ref) else {
            return Err((
                FailureStage::Configuration,
                format!("capability {:?} not registered", task.capability_ref),
                0,
            ));
        };

        let scope = InternalScope::new();
        let nucleus = factory.build(task, scope.clone());
        let ctx = RunContext {
            goal: Arc::clone(&self.goal),
            packet: Arc::clone(&self.packet),
            task: task.clone(),
            nucleus: Arc::clone(&nucleus),
            scope: scope.clone(),
            outputs: Arc::clone(outputs),
            tools: Arc::clone(&self.tools),
            capabilities: Arc::clone(&self.capabilities),
            ledger: Arc::clone(&self.ledger),
            stream: Arc::clone(&self.stream),
            context_ref: self.plan.context_ref.clone(),
        };
        let rounds = |nucleus: &crate::nucleus::Nucleus| u64::from(nucleus.metrics().rounds);

        self.ledger.append(
            EntryType::TaskStart,
            json!({
                "taskId": task.id,
                "capabilityRef": task.capability_ref,
                "title": task.title,
            }),
        );
        self.stream
            .emit("task", &task.id, json!({"stage": "start"}));

        // Preflight, with at most one retrieval round.
        if let Err((stage, message)) = self.preflight(task, &nucleus, &scope).await {
            return Err((stage, message, rounds(&nucleus)));
        }

        // Policy pre.
        if let Some(policy) = &self.policy {
            let payload = json!({
                "taskId": task.id,
                "capabilityRef": task.capability_ref,
                "input": task.input,
                "goalId": self.goal.id,
            });
            let decision = policy.evaluate(ACTION_TASK_PRE, payload).await;
            let decision_value = serde_json::to_value(&decision).unwrap_or(Value::Null);
            self.ledger.append(
                EntryType::PolicyPre,
                json!({"taskId": task.id, "decision": decision_value}),
            );
            record_policy(policy_state, &task.id, "pre", decision_value);
            if !decision.allow {
                let reason = decision.reason.unwrap_or_else(|| "policy denied".to_owned());
                return Err((FailureStage::PolicyPre, reason, rounds(&nucleus)));
            }
        }

        // Execute with retry.
        let output = match self.execute_with_retry(task, &handler, &ctx).await {
            Ok(output) => output,
            Err(message) => {
                self.note_compensation_edges(task, &message);
                return Err((FailureStage::Execute, message, rounds(&nucleus)));
            }
        };

        // Policy post.
        if let Some(policy) = &self.policy {
            let decision = policy
                .evaluate(ACTION_TASK_POST, json!({"taskId": task.id, "output": output}))
                .await;
            let decision_value = serde_json::to_value(&decision).unwrap_or(Value::Null);
            self.ledger.append(
                EntryType::PolicyPost,
                json!({"taskId": task.id, "decision": decision_value}),
            );
            record_policy(policy_state, &task.id, "post", decision_value);
            if !decision.allow {
                let reason = decision.reason.unwrap_or_else(|| "policy denied".to_owned());
                return Err((FailureStage::PolicyPost, reason, rounds(&nucleus)));
            }
        }

        // Verification.
        if !task.verification.is_empty() {
            let results: Vec<bool> = task
                .verification
                .iter()
                .map(|expr| self.verifier.verify(&task.id, &output, expr))
                .collect();
            let all_passed = results.iter().all(|&r| r);
            self.ledger.append(
                EntryType::Verification,
                json!({
                    "taskId": task.id,
                    "expressions": task.verification,
                    "results": results,
                    "result": all_passed,
                }),
            );
            if !all_passed {
                let failed: Vec<&String> = task
                    .verification
                    .iter()
                    .zip(&results)
                    .filter(|(_, &passed)| !passed)
                    .map(|(expr, _)| expr)
                    .collect();
                return Err((
                    FailureStage::Verification,
                    format!("verification failed: {failed:?}"),
                    rounds(&nucleus),
                ));
            }
        }

        // Nucleus postcheck.
        match nucleus.postcheck(task, &output).await {
            Ok(PostcheckOutcome::Complete) => {}
            Ok(PostcheckOutcome::NeedsCompensation { reason }) => {
                self.ledger.append(
                    EntryType::Error,
                    json!({"taskId": task.id, "stage": "NUCLEUS_POSTCHECK", "reason": reason}),
                );
                self.ledger.append(
                    EntryType::Compensation,
                    json!({"taskId": task.id, "source": "postcheck", "reason": reason}),
                );
                return Err((
                    FailureStage::Postcheck,
                    format!("postcheck demands compensation: {reason}"),
                    rounds(&nucleus),
                ));
            }
            Ok(PostcheckOutcome::Escalate { reason }) => {
                self.ledger.append(
                    EntryType::Error,
                    json!({"taskId": task.id, "stage": "NUCLEUS_POSTCHECK", "reason": reason}),
                );
                return Err((
                    FailureStage::Postcheck,
                    format!("postcheck escalated: {reason}"),
                    rounds(&nucleus),
                ));
            }
            Err(e) => {
                return Err((FailureStage::Postcheck, e.to_string(), rounds(&nucleus)));
            }
        }

        // Commit: TASK_END first, then outputs/executed become visible.
        let narrative = format!(
            "{} completed via {}",
            task.title.as_deref().unwrap_or(&task.id),
            task.capability_ref
        );
        self.ledger.append(
            EntryType::TaskEnd,
            json!({"taskId": task.id, "output": output, "narrative": narrative}),
        );
        if let Ok(mut map) = outputs.lock() {
            // Write-once: a task never overwrites an existing output.
            map.entry(task.id.clone()).or_insert(output);
        }
        self.stream.emit("task", &task.id, json!({"stage": "end"}));
        self.stream.close(&task.id);

        Ok(rounds(&nucleus))
    }

    async fn preflight(
        &self,
        task: &TaskSpec,
        nucleus: &Arc<crate::nucleus::Nucleus>,
        scope: &InternalScope,
    ) -> Result<(), (FailureStage, String)> {
        let first = nucleus
            .preflight(task)
            .await
            .map_err(|e| (FailureStage::Preflight, e.to_string()))?;

        let directives = match first {
            PreflightOutcome::Ready => return Ok(()),
            PreflightOutcome::NeedsContext { directives } => directives,
        };

        let Some(provider) = &self.context_provider else {
            let raw: Vec<&str> = directives.iter().map(|d| d.raw.as_str()).collect();
            return Err((
                FailureStage::Preflight,
                format!("task needs context but no provider is configured: {raw:?}"),
            ));
        };

        // Exactly one fulfillment round, then one re-check.
        provider.fulfill(&directives, scope, &self.ledger).await;

        match nucleus.preflight(task).await {
            Ok(PreflightOutcome::Ready) => Ok(()),
            Ok(PreflightOutcome::NeedsContext { directives }) => {
                let unresolved: Vec<String> = directives.iter().map(|d| d.raw.clone()).collect();
                self.ledger.append(
                    EntryType::ContextInternalized,
                    json!({
                        "taskId": task.id,
                        "status": "unresolved",
                        "directives": unresolved,
                    }),
                );
                Err((
                    FailureStage::ContextRetrieval,
                    format!("context still insufficient after retrieval: {unresolved:?}"),
                ))
            }
            Err(e) => Err((FailureStage::Preflight, e.to_string())),
        }
    }

    async fn execute_with_retry(
        &self,
        task: &TaskSpec,
        handler: &Arc<dyn TaskHandler>,
        ctx: &RunContext,
    ) -> Result<Value, String> {
        let retry_spec = task.retry.clone().or_else(|| {
            task.retry_policy
                .as_ref()
                .map(|_| self.default_retry.clone())
        });
        let attempts = retry_spec.as_ref().map(|r| r.attempts.max(1)).unwrap_or(1);

        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match handler.execute(ctx.clone(), task.input.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) if attempt < attempts => {
                    let delay = retry_spec
                        .as_ref()
                        .map(|spec| retry::backoff_delay(spec, attempt))
                        .unwrap_or_default();
                    warn!(
                        task_id = %task.id,
                        attempt,
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "task attempt failed, backing off"
                    );
                    self.stream.emit(
                        "task",
                        &task.id,
                        json!({"stage": "retry", "attempt": attempt, "error": e.to_string()}),
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(format!("failed after {attempt} attempt(s): {e}"));
                }
            }
        }
    }

    /// A failing task whose inbound edge demands compensation gets a
    /// `COMPENSATION` annotation. Routing to compensation branches is not
    /// implemented; the failure stays fatal.
    fn note_compensation_edges(&self, task: &TaskSpec, message: &str) {
        for edge in self.plan.incoming_edges(&task.id) {
            if edge.on_error == Some(EdgeErrorMode::CompensationRequired) {
                self.ledger.append(
                    EntryType::Compensation,
                    json!({
                        "taskId": task.id,
                        "edge": edge.label(),
                        "source": "edge",
                        "reason": message,
                    }),
                );
            }
        }
    }

    // -- termination --------------------------------------------------------

    async fn goal_summary(&self, factory: &NucleusFactory, executed: &BTreeSet<String>) -> String {
        let outcomes: Vec<(String, bool)> = self
            .plan
            .tasks
            .iter()
            .map(|t| (t.id.clone(), executed.contains(&t.id)))
            .collect();
        let prompt =
            crate::nucleus::prompt::goal_summary_prompt(&self.goal, &self.plan.id, &outcomes);

        let summary_task = TaskSpec::new("goal-summary", "");
        let nucleus = factory.build(&summary_task, InternalScope::new());
        let text = match nucleus.summarize("goal_summary", &prompt).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) | Err(_) => format!(
                "Executed {}/{} task(s) for goal {:?}.",
                executed.len(),
                self.plan.tasks.len(),
                self.goal.intent
            ),
        };

        self.ledger.append(
            EntryType::GoalSummary,
            json!({
                "goalId": self.goal.id,
                "planId": self.plan.id,
                "text": text,
                "tasksExecuted": executed.len(),
            }),
        );
        text
    }

    fn finalize_metrics(
        &self,
        base: RunMetrics,
        started: Instant,
        executed: &BTreeSet<String>,
        nucleus_rounds: u64,
    ) -> RunMetrics {
        RunMetrics {
            tasks_executed: u64::try_from(executed.len()).unwrap_or(u64::MAX),
            tool_calls: self.count_tool_calls(),
            nucleus_rounds: base.nucleus_rounds.saturating_add(nucleus_rounds),
            elapsed_secs: base.elapsed_secs + started.elapsed().as_secs_f64(),
        }
    }

    /// Tool calls over the whole ledger (restored entries included), so
    /// the counter is cumulative across resumes.
    fn count_tool_calls(&self) -> u64 {
        self.ledger
            .entries_by_type(EntryType::ToolCall)
            .iter()
            .filter(|e| e.details.get("stage").and_then(Value::as_str) == Some("start"))
            .count()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    async fn snapshot(
        &self,
        outputs: &SharedOutputs,
        executed: &BTreeSet<String>,
        base: RunMetrics,
        started: Instant,
        nucleus_rounds: u64,
    ) -> Option<String> {
        let store = self.checkpoint_store.as_ref()?;
        let checkpoint = Checkpoint::capture(
            self.run_id.clone(),
            CheckpointState {
                goal: (*self.goal).clone(),
                context: (*self.packet).clone(),
                plan: self.plan.clone(),
                outputs: outputs.lock().map(|m| m.clone()).unwrap_or_default(),
                executed: executed.clone(),
                ledger: self.ledger.entries(),
                metrics: self.finalize_metrics(base, started, executed, nucleus_rounds),
            },
        );
        match store.put(&checkpoint).await {
            Ok(()) => Some(checkpoint.id),
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "checkpoint write failed");
                None
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    fn failure(
        &self,
        task_id: Option<String>,
        stage: FailureStage,
        checkpoint_id: Option<String>,
        message: String,
    ) -> RunFailure {
        RunFailure {
            run_id: self.run_id.clone(),
            task_id,
            stage,
            checkpoint_id,
            message,
        }
    }
}

fn record_policy(state: &mut Map<String, Value>, task_id: &str, phase: &str, decision: Value) {
    let entry = state
        .entry(task_id.to_owned())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(map) = entry {
        map.insert(phase.to_owned(), decision);
    }
}
