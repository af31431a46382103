//! Kernel facade: normalize inputs, wire planner + scheduler, run.
//!
//! [`Kernel`] owns the long-lived wiring (transport, registries, policy,
//! stores) and exposes the three operations embedders call:
//! [`Kernel::plan`], [`Kernel::execute`], and
//! [`Kernel::plan_and_execute`]. Each run shares one ledger between the
//! planner and the scheduler, so the replay bundle sees the whole story.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::bundle::{PlannerRecord, RunArtifacts, TaskIo};
use crate::capability::CapabilityRegistry;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::context::{ContextPacket, ContextProvider};
use crate::ledger::Ledger;
use crate::nucleus::NucleusConfig;
use crate::plan::{Plan, RetrySpec};
use crate::planner::{Planner, PlannerError, PlannerResult};
use crate::policy::{PolicyEngine, ACTION_PLAN_ADMIT};
use crate::providers::LlmProvider;
use crate::runtime::verify::Verifier;
use crate::runtime::{ExecutionResult, RunFailure, Scheduler};
use crate::stream::StreamSink;
use crate::tools::ToolRegistry;
use crate::types::Goal;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Facade-level failures.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Planning failed.
    #[error(transparent)]
    Planner(#[from] PlannerError),
    /// Execution failed; carries task, stage, and resume checkpoint.
    #[error(transparent)]
    Run(#[from] RunFailure),
    /// The policy engine refused to admit the plan.
    #[error("plan {plan_id} not admitted: {reason}")]
    PlanNotAdmitted {
        /// The refused plan.
        plan_id: String,
        /// The engine's reason.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Options and outcomes
// ---------------------------------------------------------------------------

/// Inputs to [`Kernel::plan`].
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// The goal to plan for.
    pub goal: Goal,
    /// The immutable context packet.
    pub context: ContextPacket,
    /// How many alternative plans to request.
    pub plan_count: u32,
}

/// Outcome of [`Kernel::plan`].
#[derive(Debug)]
pub struct PlanOutcome {
    /// Goal with normalized id.
    pub goal: Goal,
    /// Packet with normalized id.
    pub context: ContextPacket,
    /// The planner's candidates and selection.
    pub result: PlannerResult,
    /// The ledger the planner wrote into.
    pub ledger: Arc<Ledger>,
}

/// Inputs to [`Kernel::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Run identifier; generated when empty.
    pub run_id: Option<String>,
    /// Restrict execution to these task ids.
    pub task_scope: Option<Vec<String>>,
    /// Resume from this checkpoint id.
    pub resume_from: Option<String>,
    /// Override the kernel-level checkpoint interval.
    pub checkpoint_interval: Option<u32>,
}

/// A finished (or planned-and-finished) run.
#[derive(Debug)]
pub struct RunOutcome {
    /// The run id.
    pub run_id: String,
    /// Goal with normalized id.
    pub goal: Goal,
    /// Packet with normalized id.
    pub context: ContextPacket,
    /// The plan that ran.
    pub plan: Plan,
    /// Planner result, when planning happened in this call.
    pub planner: Option<PlannerResult>,
    /// The execution result.
    pub execution: ExecutionResult,
    /// The shared run ledger.
    pub ledger: Arc<Ledger>,
}

impl RunOutcome {
    /// Assemble bundle artifacts from this run.
    pub fn artifacts(&self, checkpoints: Vec<Checkpoint>) -> RunArtifacts {
        let task_io = self
            .plan
            .tasks
            .iter()
            .filter_map(|task| {
                self.execution.outputs_by_task.get(&task.id).map(|output| {
                    (
                        task.id.clone(),
                        TaskIo {
                            input: task.input.clone(),
                            output: output.clone(),
                        },
                    )
                })
            })
            .collect();

        let planner = self.planner.as_ref().map(|p| PlannerRecord {
            prompt_digest: p.prompt_digest.clone(),
            rationale: p.rationale.clone(),
            metrics: p.metrics,
            rejected: p.rejected.clone(),
        });

        RunArtifacts {
            run_id: self.run_id.clone(),
            goal: self.goal.clone(),
            context: self.context.clone(),
            plans: self
                .planner
                .as_ref()
                .map(|p| p.plans.clone())
                .unwrap_or_else(|| vec![self.plan.clone()]),
            selected_plan_id: self.plan.id.clone(),
            planner,
            ledger_entries: self.ledger.entries(),
            task_io,
            checkpoints,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`Kernel`].
pub struct KernelBuilder {
    provider: Arc<dyn LlmProvider>,
    capabilities: Arc<CapabilityRegistry>,
    tools: Arc<ToolRegistry>,
    nucleus_config: NucleusConfig,
    policy: Option<Arc<dyn PolicyEngine>>,
    verifier: Option<Arc<dyn Verifier>>,
    context_provider: Option<Arc<dyn ContextProvider>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    checkpoint_interval: u32,
    stream: Option<Arc<dyn StreamSink>>,
    default_retry: RetrySpec,
}

impl KernelBuilder {
    /// Attach the capability registry, builder style.
    #[must_use]
    pub fn capabilities(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.capabilities = registry;
        self
    }

    /// Attach the tool registry, builder style.
    #[must_use]
    pub fn tools(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.tools = registry;
        self
    }

    /// Set the nucleus configuration, builder style.
    #[must_use]
    pub fn nucleus_config(mut self, config: NucleusConfig) -> Self {
        self.nucleus_config = config;
        self
    }

    /// Attach a policy engine, builder style.
    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn PolicyEngine>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Replace the default verifier, builder style.
    #[must_use]
    pub fn verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Attach a context provider, builder style.
    #[must_use]
    pub fn context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context_provider = Some(provider);
        self
    }

    /// Attach a checkpoint store, builder style.
    #[must_use]
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Checkpoint after this many completed tasks, builder style.
    #[must_use]
    pub fn checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    /// Attach a stream sink, builder style.
    #[must_use]
    pub fn stream(mut self, sink: Arc<dyn StreamSink>) -> Self {
        self.stream = Some(sink);
        self
    }

    /// Default retry for tasks naming a `retry_policy`, builder style.
    #[must_use]
    pub fn default_retry(mut self, retry: RetrySpec) -> Self {
        self.default_retry = retry;
        self
    }

    /// Finish the kernel.
    pub fn build(self) -> Kernel {
        Kernel {
            provider: self.provider,
            capabilities: self.capabilities,
            tools: self.tools,
            nucleus_config: self.nucleus_config,
            policy: self.policy,
            verifier: self.verifier,
            context_provider: self.context_provider,
            checkpoint_store: self.checkpoint_store,
            checkpoint_interval: self.checkpoint_interval,
            stream: self.stream,
            default_retry: self.default_retry,
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// The framework facade. Build once, run many.
pub struct Kernel {
    provider: Arc<dyn LlmProvider>,
    capabilities: Arc<CapabilityRegistry>,
    tools: Arc<ToolRegistry>,
    nucleus_config: NucleusConfig,
    policy: Option<Arc<dyn PolicyEngine>>,
    verifier: Option<Arc<dyn Verifier>>,
    context_provider: Option<Arc<dyn ContextProvider>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    checkpoint_interval: u32,
    stream: Option<Arc<dyn StreamSink>>,
    default_retry: RetrySpec,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("model", &self.provider.model_id())
            .field("capabilities", &self.capabilities.count())
            .field("tools", &self.tools.count())
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Start building a kernel around a transport.
    pub fn builder(provider: Arc<dyn LlmProvider>) -> KernelBuilder {
        KernelBuilder {
            provider,
            capabilities: Arc::new(CapabilityRegistry::new()),
            tools: Arc::new(ToolRegistry::new()),
            nucleus_config: NucleusConfig::default(),
            policy: None,
            verifier: None,
            context_provider: None,
            checkpoint_store: None,
            checkpoint_interval: 1,
            stream: None,
            default_retry: RetrySpec {
                attempts: 3,
                ..RetrySpec::default()
            },
        }
    }

    /// Produce candidate plans for a goal.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Planner`] when planning fails.
    pub async fn plan(&self, options: PlanOptions) -> Result<PlanOutcome, KernelError> {
        let (goal, context) = normalize(options.goal, options.context);
        let ledger = Arc::new(Ledger::new());

        let planner = Planner::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.capabilities),
            Arc::clone(&ledger),
            self.nucleus_config.clone(),
        );
        let result = planner.plan(&goal, &context, options.plan_count).await?;

        Ok(PlanOutcome {
            goal,
            context,
            result,
            ledger,
        })
    }

    /// Execute an existing plan.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] on policy refusal or run failure.
    pub async fn execute(
        &self,
        goal: Goal,
        context: ContextPacket,
        plan: Plan,
        options: ExecuteOptions,
    ) -> Result<RunOutcome, KernelError> {
        let ledger = Arc::new(Ledger::new());
        self.execute_inner(goal, context, plan, None, ledger, options, None)
            .await
    }

    /// Plan, select, and execute in one call, sharing a single ledger.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] on planning failure, policy refusal, or
    /// run failure.
    pub async fn plan_and_execute(
        &self,
        goal: Goal,
        context: ContextPacket,
        plan_count: u32,
        options: ExecuteOptions,
    ) -> Result<RunOutcome, KernelError> {
        let (goal, context) = normalize(goal, context);
        let ledger = Arc::new(Ledger::new());

        let planner = Planner::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.capabilities),
            Arc::clone(&ledger),
            self.nucleus_config.clone(),
        );
        let result = planner.plan(&goal, &context, plan_count).await?;
        let plan = result.selected().clone();

        self.execute_inner(goal, context, plan, Some(result), ledger, options, None)
            .await
    }

    /// Execute with an external cancellation signal.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] on policy refusal or run failure
    /// (including cancellation).
    pub async fn execute_with_cancellation(
        &self,
        goal: Goal,
        context: ContextPacket,
        plan: Plan,
        options: ExecuteOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome, KernelError> {
        let ledger = Arc::new(Ledger::new());
        self.execute_inner(goal, context, plan, None, ledger, options, Some(cancel))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_inner(
        &self,
        goal: Goal,
        context: ContextPacket,
        plan: Plan,
        planner: Option<PlannerResult>,
        ledger: Arc<Ledger>,
        options: ExecuteOptions,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<RunOutcome, KernelError> {
        let (goal, context) = normalize(goal, context);
        let run_id = options
            .run_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(policy) = &self.policy {
            let decision = policy
                .evaluate(
                    ACTION_PLAN_ADMIT,
                    serde_json::json!({
                        "planId": plan.id,
                        "taskCount": plan.tasks.len(),
                        "capabilityMapVersion": plan.capability_map_version,
                        "runId": run_id,
                    }),
                )
                .await;
            if !decision.allow {
                return Err(KernelError::PlanNotAdmitted {
                    plan_id: plan.id.clone(),
                    reason: decision.reason.unwrap_or_else(|| "policy denied".to_owned()),
                });
            }
        }

        let mut scheduler = Scheduler::new(
            goal.clone(),
            context.clone(),
            plan.clone(),
            Arc::clone(&self.capabilities),
            Arc::clone(&self.tools),
            Arc::clone(&self.provider),
            Arc::clone(&ledger),
            run_id.clone(),
        )
        .with_nucleus_config(self.nucleus_config.clone())
        .with_default_retry(self.default_retry.clone())
        .with_checkpoint_interval(
            options.checkpoint_interval.unwrap_or(self.checkpoint_interval),
        );

        if let Some(policy) = &self.policy {
            scheduler = scheduler.with_policy(Arc::clone(policy));
        }
        if let Some(verifier) = &self.verifier {
            scheduler = scheduler.with_verifier(Arc::clone(verifier));
        }
        if let Some(provider) = &self.context_provider {
            scheduler = scheduler.with_context_provider(Arc::clone(provider));
        }
        if let Some(store) = &self.checkpoint_store {
            scheduler = scheduler.with_checkpoint_store(Arc::clone(store));
        }
        if let Some(sink) = &self.stream {
            scheduler = scheduler.with_stream(Arc::clone(sink));
        }
        if let Some(scope) = options.task_scope {
            scheduler = scheduler.with_task_scope(scope);
        }
        if let Some(checkpoint_id) = options.resume_from {
            scheduler = scheduler.with_resume_from(checkpoint_id);
        }
        if let Some(cancel) = cancel {
            scheduler = scheduler.with_cancellation(cancel);
        }

        let execution = scheduler.run().await?;

        Ok(RunOutcome {
            run_id,
            goal,
            context,
            plan,
            planner,
            execution,
            ledger,
        })
    }
}

/// Fill in missing goal/context ids.
fn normalize(mut goal: Goal, mut context: ContextPacket) -> (Goal, ContextPacket) {
    goal.normalize_id();
    context.normalize_id();
    (goal, context)
}
