//! LLM planner: goal in, validated candidate plans out.
//!
//! The planner drives a nucleus through two stages, **thinking**
//! (freeform goal analysis) then **emit** (a structured plan document),
//! and parses the emitted JSON into candidate [`Plan`]s. Candidates
//! referencing unknown capabilities, dangling edges, or cycles are
//! rejected with a recorded reason; survivors are stamped with the
//! packet's `context_ref` and the registry's capability-map version.
//! Selection defaults to the first valid candidate.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capability::CapabilityRegistry;
use crate::context::{ContextPacket, InternalScope};
use crate::digest::digest_text;
use crate::ledger::Ledger;
use crate::nucleus::{extract_json, NucleusConfig, NucleusError, NucleusFactory, NucleusMetrics};
use crate::plan::{Edge, Plan, TaskSpec};
use crate::providers::LlmProvider;
use crate::types::Goal;

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

/// Thinking-stage role prompt.
const THINKING_ROLE: &str = "\
You are the planner of an execution kernel. Analyze the goal before \
emitting any plan: what must happen, in what order, what depends on what, \
and which of the registered capabilities cover each piece. Do not emit a \
plan yet; reason in prose. Capabilities not in the list below do not \
exist; never invent one.";

/// Emit-stage role prompt with the required document shape.
const EMIT_ROLE: &str = "\
Now emit the plan document. Respond with JSON only, no prose:
{
  \"plans\": [
    {
      \"id\": \"optional-plan-id\",
      \"rationale\": \"why this decomposition\",
      \"tasks\": [
        {\"id\": \"t1\", \"capabilityRef\": \"registered-capability\", \
\"input\": {}, \"objective\": \"...\"}
      ],
      \"edges\": [
        {\"from\": \"t1\", \"to\": \"t2\", \"guard\": \"optional guard expression\"}
      ]
    }
  ]
}
Every capabilityRef must come from the capability list. Edges must \
reference declared task ids and must not form cycles.";

fn thinking_prompt(goal: &Goal, packet: &ContextPacket, capabilities: &str) -> String {
    let constraints = if goal.constraints.is_empty() {
        "(none)".to_owned()
    } else {
        goal.constraints.join("; ")
    };
    format!(
        "{THINKING_ROLE}\n\n## Goal\n{intent}\nConstraints: {constraints}\n\n\
         ## Context keys\n{keys}\n\n## Registered capabilities\n{capabilities}",
        intent = goal.intent,
        keys = packet.fact_keys().join(", "),
    )
}

fn emit_prompt(analysis: &str, plan_count: u32, capabilities: &str) -> String {
    format!(
        "Your analysis was:\n{analysis}\n\n{EMIT_ROLE}\n\n\
         Emit up to {plan_count} alternative plan(s), best first.\n\n\
         ## Registered capabilities\n{capabilities}"
    )
}

// ---------------------------------------------------------------------------
// Errors and result
// ---------------------------------------------------------------------------

/// Planner failures.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// The nucleus/transport failed.
    #[error(transparent)]
    Nucleus(#[from] NucleusError),
    /// The emit stage produced no parseable plan document.
    #[error("no plan document found in planner output: {0}")]
    UnparseableDocument(String),
    /// Every candidate was rejected.
    #[error("no viable plan: {0:?}")]
    NoViablePlan(Vec<(String, String)>),
}

/// Outcome of one planning call.
#[derive(Debug, Clone)]
pub struct PlannerResult {
    /// Valid candidates, stamped and ready to execute.
    pub plans: Vec<Plan>,
    /// Index of the selected candidate in `plans`.
    pub selected_index: usize,
    /// Rationale of the selected plan.
    pub rationale: Option<String>,
    /// Digest of the emit-stage prompt.
    pub prompt_digest: String,
    /// Nucleus telemetry across both stages.
    pub metrics: NucleusMetrics,
    /// Rejected candidates as `(label, reason)`.
    pub rejected: Vec<(String, String)>,
}

impl PlannerResult {
    /// The selected plan.
    pub fn selected(&self) -> &Plan {
        &self.plans[self.selected_index]
    }
}

/// Chooses among valid candidates. Receives the stamped plans, returns
/// an index into them.
pub type PlanSelector = dyn Fn(&[Plan]) -> usize + Send + Sync;

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Drives a nucleus to produce plans targeting registered capabilities.
pub struct Planner {
    provider: Arc<dyn LlmProvider>,
    capabilities: Arc<CapabilityRegistry>,
    ledger: Arc<Ledger>,
    config: NucleusConfig,
    selector: Option<Box<PlanSelector>>,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("model", &self.provider.model_id())
            .field("capabilities", &self.capabilities.count())
            .finish_non_exhaustive()
    }
}

impl Planner {
    /// Planner over a transport, capability map, and ledger.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        capabilities: Arc<CapabilityRegistry>,
        ledger: Arc<Ledger>,
        config: NucleusConfig,
    ) -> Self {
        Self {
            provider,
            capabilities,
            ledger,
            config,
            selector: None,
        }
    }

    /// Replace the default first-valid selection, builder style.
    #[must_use]
    pub fn with_selector(
        mut self,
        selector: impl Fn(&[Plan]) -> usize + Send + Sync + 'static,
    ) -> Self {
        self.selector = Some(Box::new(selector));
        self
    }

    /// Produce up to `plan_count` candidate plans for `goal`.
    ///
    /// # Errors
    ///
    /// Returns [`PlannerError`] when the transport fails, no document
    /// parses, or every candidate is rejected.
    pub async fn plan(
        &self,
        goal: &Goal,
        packet: &ContextPacket,
        plan_count: u32,
    ) -> Result<PlannerResult, PlannerError> {
        let capability_listing = self.capability_listing();
        let factory = NucleusFactory {
            provider: Arc::clone(&self.provider),
            config: self.config.clone(),
            ledger: Arc::clone(&self.ledger),
            packet: Arc::new(packet.clone()),
            context_provider: None,
        };
        let planner_task = TaskSpec::new("planner", "");
        let nucleus = factory.build(&planner_task, InternalScope::new());

        // Stage 1: thinking.
        let analysis = nucleus
            .summarize(
                "planner_thinking",
                &thinking_prompt(goal, packet, &capability_listing),
            )
            .await?;
        debug!(goal = %goal.id, analysis_chars = analysis.len(), "planner analysis complete");

        // Stage 2: emit.
        let emit = emit_prompt(&analysis, plan_count.max(1), &capability_listing);
        let prompt_digest = digest_text(&emit);
        let document_text = nucleus.summarize("planner_emit", &emit).await?;

        let document = parse_plan_document(&document_text).ok_or_else(|| {
            PlannerError::UnparseableDocument(preview(&document_text, 200))
        })?;

        // Validate and stamp each candidate.
        let context_ref = packet.context_ref();
        let map_version = self.capabilities.version();
        let mut plans = Vec::new();
        let mut rejected = Vec::new();

        for (index, candidate) in document.into_iter().enumerate() {
            let label = candidate
                .get("id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| format!("candidate-{index}"));
            match self.admit_candidate(candidate, &context_ref, &map_version) {
                Ok(plan) => plans.push(plan),
                Err(reason) => {
                    warn!(candidate = %label, %reason, "plan candidate rejected");
                    rejected.push((label, reason));
                }
            }
        }

        if plans.is_empty() {
            return Err(PlannerError::NoViablePlan(rejected));
        }

        let selected_index = self
            .selector
            .as_ref()
            .map(|select| select(&plans).min(plans.len().saturating_sub(1)))
            .unwrap_or(0);
        let rationale = plans[selected_index].rationale.clone();

        Ok(PlannerResult {
            plans,
            selected_index,
            rationale,
            prompt_digest,
            metrics: nucleus.metrics(),
            rejected,
        })
    }

    /// Parse one raw candidate into a stamped, validated [`Plan`].
    fn admit_candidate(
        &self,
        candidate: Value,
        context_ref: &str,
        map_version: &str,
    ) -> Result<Plan, String> {
        let tasks: Vec<TaskSpec> = serde_json::from_value(
            candidate.get("tasks").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| format!("tasks did not parse: {e}"))?;
        if tasks.is_empty() {
            return Err("candidate has no tasks".to_owned());
        }

        let edges: Vec<Edge> = match candidate.get("edges") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| format!("edges did not parse: {e}"))?,
            None => Vec::new(),
        };

        let mut plan = Plan::new(
            candidate
                .get("id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| format!("plan-{}", Uuid::new_v4())),
        );
        plan.tasks = tasks;
        plan.edges = edges;
        plan.rationale = candidate
            .get("rationale")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);

        for task in &plan.tasks {
            if !self.capabilities.has(&task.capability_ref) {
                return Err(format!(
                    "task {:?} targets unregistered capability {:?}",
                    task.id, task.capability_ref
                ));
            }
        }
        plan.validate_structure().map_err(|e| e.to_string())?;

        plan.context_ref = context_ref.to_owned();
        plan.capability_map_version = map_version.to_owned();
        Ok(plan)
    }

    /// The capability map as shown to the model.
    fn capability_listing(&self) -> String {
        let entries: Vec<Value> = self
            .capabilities
            .list()
            .into_iter()
            .map(|c| {
                serde_json::json!({
                    "name": c.name,
                    "inputSchema": c.input_schema,
                    "outputSchema": c.output_schema,
                    "sideEffects": c.side_effects,
                })
            })
            .collect();
        serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_owned())
    }
}

// ---------------------------------------------------------------------------
// Document parsing
// ---------------------------------------------------------------------------

/// Parse the emit-stage output into raw candidate values.
///
/// Strips reasoning-model tags, then leans on the shared lenient JSON
/// extraction. Accepts either `{"plans": [...]}` or a single bare plan
/// object `{"tasks": [...]}`.
fn parse_plan_document(text: &str) -> Option<Vec<Value>> {
    let cleaned = strip_reasoning_tags(text);
    let value = extract_json(cleaned.trim())?;

    if let Some(plans) = value.get("plans").and_then(Value::as_array) {
        if plans.is_empty() {
            return None;
        }
        return Some(plans.clone());
    }
    if value.get("tasks").is_some() {
        return Some(vec![value]);
    }
    None
}

/// Drop `<think>...</think>` blocks emitted by reasoning models.
fn strip_reasoning_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => {
                rest = &rest[start.saturating_add(end).saturating_add("</think>".len())..];
            }
            None => {
                // Unclosed tag: drop everything after it.
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn preview(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_owned();
    }
    let shortened: String = text.chars().take(limit).collect();
    format!("{shortened}…")
}
