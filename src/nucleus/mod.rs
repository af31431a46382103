//! The nucleus: per-task LLM controller.
//!
//! Each task gets its own [`Nucleus`], built by the scheduler from a
//! [`NucleusFactory`]. The nucleus runs the task's reasoning lifecycle:
//!
//! 1. [`Nucleus::preflight`]: is the visible context sufficient? May
//!    return retrieval directives for the context provider.
//! 2. [`Nucleus::invoke`]: a bounded tool-calling loop. Each round is
//!    ledgered as `NUCLEUS_INFERENCE`; the model is offered the fixed
//!    context tools (`query_context`, and `request_context_retrieval`
//!    while retrieval rounds remain) plus the task's allowed tools.
//!    The loop stops on a terminal answer, at `max_query_rounds`, or when
//!    the cumulative prompt-token estimate crosses 85% of
//!    `max_context_tokens`, which forces a final no-tools answer.
//! 3. [`Nucleus::postcheck`]: judge the output; may demand compensation
//!    or escalation.
//!
//! Preflight and postcheck are opt-in hooks; disabled they short-circuit
//! to `Ready`/`Complete`.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::{ContextPacket, ContextProvider, InternalScope, RetrievalDirective};
use crate::digest::digest_text;
use crate::ledger::{EntryType, Ledger};
use crate::plan::TaskSpec;
use crate::providers::{
    CompletionRequest, CompletionResponse, ContentPart, LlmProvider, Message, ProviderError,
    StopReason, ToolDefinition,
};
use crate::runtime::context::RunContext;

pub mod prompt;
pub mod tokens;

/// Name of the built-in tool that reads the internal scope and packet facts.
pub const QUERY_CONTEXT_TOOL: &str = "query_context";

/// Name of the built-in tool that requests an external retrieval.
pub const REQUEST_RETRIEVAL_TOOL: &str = "request_context_retrieval";

/// Fraction of `max_context_tokens` at which finalization is forced.
const BUDGET_FORCE_RATIO: f64 = 0.85;

/// Malformed tool-call payloads tolerated before the invocation fails.
const MAX_MALFORMED_RETRIES: u32 = 2;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-run nucleus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NucleusConfig {
    /// Context window budget in tokens. Finalization is forced at 85%.
    pub max_context_tokens: u64,
    /// Maximum inference rounds per invocation.
    pub max_query_rounds: u32,
    /// Maximum retrieval fulfillments per invocation.
    pub max_retrieval_rounds: u32,
    /// Whether the preflight hook runs.
    pub preflight_enabled: bool,
    /// Whether the postcheck hook runs.
    pub postcheck_enabled: bool,
    /// Run-level tool allowance; merged with each task's `tools`.
    pub allowed_tools: Vec<String>,
    /// Maximum response tokens requested per round.
    pub max_answer_tokens: u32,
}

impl Default for NucleusConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 32_768,
            max_query_rounds: 3,
            max_retrieval_rounds: 1,
            preflight_enabled: false,
            postcheck_enabled: false,
            allowed_tools: Vec::new(),
            max_answer_tokens: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes and metrics
// ---------------------------------------------------------------------------

/// Result of a preflight check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightOutcome {
    /// Context suffices; proceed to execution.
    Ready,
    /// More context is needed; the runtime should fulfill these
    /// directives (at most once) and re-run preflight.
    NeedsContext {
        /// Parsed retrieval directives.
        directives: Vec<RetrievalDirective>,
    },
}

/// Result of a postcheck judgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostcheckOutcome {
    /// The output stands.
    Complete,
    /// Completed work must be undone.
    NeedsCompensation {
        /// Why compensation is required.
        reason: String,
    },
    /// A human must decide.
    Escalate {
        /// Why escalation is required.
        reason: String,
    },
}

/// Telemetry for one nucleus invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NucleusMetrics {
    /// Inference rounds consumed.
    pub rounds: u32,
    /// Cumulative prompt-token estimate across rounds.
    pub estimated_prompt_tokens: u64,
    /// Whether the budget forced finalization.
    pub budget_exhausted: bool,
    /// Retrieval fulfillments consumed.
    pub retrieval_rounds_used: u32,
}

/// Final answer plus telemetry from [`Nucleus::invoke`].
#[derive(Debug, Clone)]
pub struct NucleusOutcome {
    /// The model's final text answer.
    pub text: String,
    /// Invocation telemetry.
    pub metrics: NucleusMetrics,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Nucleus failures.
#[derive(Debug, Error)]
pub enum NucleusError {
    /// The transport failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The model kept emitting malformed tool calls past the retry budget.
    #[error("malformed tool call for {tool:?} after {retries} retries: {message}")]
    MalformedToolCall {
        /// Tool the model was trying to call.
        tool: String,
        /// Retries consumed.
        retries: u32,
        /// Last failure.
        message: String,
    },
    /// Preflight demanded context but emitted no parseable directive.
    #[error("preflight requested context but no directive parsed: {0:?}")]
    MalformedDirectives(Vec<String>),
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds a per-task [`Nucleus`] from run-shared resources.
#[derive(Clone)]
pub struct NucleusFactory {
    /// The shared transport.
    pub provider: Arc<dyn LlmProvider>,
    /// Run-level configuration.
    pub config: NucleusConfig,
    /// The run ledger.
    pub ledger: Arc<Ledger>,
    /// The immutable context packet.
    pub packet: Arc<ContextPacket>,
    /// Retrieval adapter, when configured.
    pub context_provider: Option<Arc<dyn ContextProvider>>,
}

impl std::fmt::Debug for NucleusFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NucleusFactory")
            .field("model", &self.provider.model_id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NucleusFactory {
    /// Build the nucleus for one task, merging the run-level tool
    /// allowance with the task's declared tools.
    pub fn build(&self, task: &TaskSpec, scope: InternalScope) -> Arc<Nucleus> {
        let mut config = self.config.clone();
        for tool in &task.tools {
            if !config.allowed_tools.contains(tool) {
                config.allowed_tools.push(tool.clone());
            }
        }
        Arc::new(Nucleus {
            provider: Arc::clone(&self.provider),
            config,
            ledger: Arc::clone(&self.ledger),
            packet: Arc::clone(&self.packet),
            scope,
            context_provider: self.context_provider.clone(),
            task_id: task.id.clone(),
            state: Mutex::new(NucleusMetrics::default()),
        })
    }
}

// ---------------------------------------------------------------------------
// Nucleus
// ---------------------------------------------------------------------------

/// Per-task LLM controller. See the module docs for the lifecycle.
pub struct Nucleus {
    provider: Arc<dyn LlmProvider>,
    config: NucleusConfig,
    ledger: Arc<Ledger>,
    packet: Arc<ContextPacket>,
    scope: InternalScope,
    context_provider: Option<Arc<dyn ContextProvider>>,
    task_id: String,
    state: Mutex<NucleusMetrics>,
}

impl std::fmt::Debug for Nucleus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nucleus")
            .field("task_id", &self.task_id)
            .field("model", &self.provider.model_id())
            .finish_non_exhaustive()
    }
}

impl Nucleus {
    /// Telemetry accumulated so far.
    pub fn metrics(&self) -> NucleusMetrics {
        self.state.lock().map(|m| *m).unwrap_or_default()
    }

    /// The internal scope this nucleus reads and the provider writes.
    pub fn scope(&self) -> &InternalScope {
        &self.scope
    }

    fn visible_keys(&self) -> Vec<String> {
        let mut keys = self.packet.fact_keys();
        keys.extend(self.scope.keys());
        keys
    }

    fn record_round(&self, phase: &str, prompt_digest: &str, reasoning: &str) {
        self.ledger.append(
            EntryType::NucleusInference,
            json!({
                "taskId": self.task_id,
                "phase": phase,
                "promptDigest": prompt_digest,
                "reasoning": preview(reasoning, 400),
                "model": self.provider.model_id(),
            }),
        );
    }

    // -- preflight ----------------------------------------------------------

    /// Check whether the visible context suffices for `task`.
    ///
    /// # Errors
    ///
    /// Returns [`NucleusError`] on transport failure or when the model
    /// demands context without one parseable directive.
    pub async fn preflight(&self, task: &TaskSpec) -> Result<PreflightOutcome, NucleusError> {
        if !self.config.preflight_enabled {
            return Ok(PreflightOutcome::Ready);
        }

        let prompt = prompt::preflight_prompt(task, &self.packet.fact_keys(), &self.scope.keys());
        let response = self.single_round("preflight", &prompt).await?;
        let text = response.text();

        let Some(verdict) = extract_json(&text) else {
            // Advisory hook: an unparseable verdict fails open.
            warn!(task_id = %self.task_id, "unparseable preflight verdict, proceeding");
            return Ok(PreflightOutcome::Ready);
        };

        if verdict.get("sufficient").and_then(Value::as_bool).unwrap_or(true) {
            return Ok(PreflightOutcome::Ready);
        }

        let raw_directives: Vec<String> = verdict
            .get("directives")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let mut directives = Vec::new();
        for raw in &raw_directives {
            match RetrievalDirective::parse(raw) {
                Ok(directive) => directives.push(directive),
                Err(e) => {
                    warn!(directive = %raw, error = %e, "skipping malformed directive");
                    self.ledger.append(
                        EntryType::Error,
                        json!({
                            "taskId": self.task_id,
                            "stage": "preflight",
                            "message": e.to_string(),
                        }),
                    );
                }
            }
        }

        if directives.is_empty() {
            return Err(NucleusError::MalformedDirectives(raw_directives));
        }
        Ok(PreflightOutcome::NeedsContext { directives })
    }

    // -- invoke -------------------------------------------------------------

    /// Run the bounded tool-calling loop and return the final answer.
    ///
    /// # Errors
    ///
    /// Returns [`NucleusError`] on transport failure or persistent
    /// malformed tool calls.
    pub async fn invoke(&self, ctx: &RunContext, opening: &str) -> Result<NucleusOutcome, NucleusError> {
        let system = prompt::system_prompt(&self.visible_keys());
        let mut messages = vec![Message::user(opening.to_owned())];
        let mut malformed_retries: u32 = 0;
        let mut last_text = String::new();

        let final_text = loop {
            let rounds_used = self.metrics().rounds;
            if rounds_used >= self.config.max_query_rounds {
                debug!(task_id = %self.task_id, rounds = rounds_used, "query round budget spent");
                break last_text;
            }

            // Account for this round's prompt before sending it.
            let round_estimate = estimate_request(&system, &messages);
            let cumulative = self.bump_tokens(round_estimate);
            let forced = budget_threshold(self.config.max_context_tokens) <= cumulative;

            let tools = if forced { Vec::new() } else { self.offered_tools(ctx) };
            let mut round_messages = messages.clone();
            if forced {
                round_messages.push(Message::user(
                    "Token budget exhausted. Give your final answer now, without tool calls.",
                ));
            }

            let rendered = render_conversation(&system, &round_messages);
            self.record_round("invoke", &digest_text(&rendered), &last_text);

            let response = self
                .provider
                .complete(CompletionRequest {
                    messages: round_messages,
                    system: Some(system.clone()),
                    tools,
                    max_tokens: Some(self.config.max_answer_tokens),
                })
                .await?;
            self.bump_rounds();

            if forced {
                self.mark_budget_exhausted();
                break response.text();
            }

            let text = response.text();
            if !text.is_empty() {
                last_text = text;
            }

            if response.tool_uses().is_empty() && response.stop_reason != StopReason::ToolUse {
                break last_text;
            }

            let results = self
                .execute_tool_calls(ctx, &response, &mut malformed_retries)
                .await?;
            messages.push(Message::assistant(response.content.clone()));
            if !results.is_empty() {
                messages.push(Message::tool_results(results));
            }
        };

        Ok(NucleusOutcome {
            text: final_text,
            metrics: self.metrics(),
        })
    }

    /// Tools offered this round: the fixed context-tool set (retrieval
    /// only while rounds remain) plus allowed task tools.
    fn offered_tools(&self, ctx: &RunContext) -> Vec<ToolDefinition> {
        let mut tools = vec![ToolDefinition {
            name: QUERY_CONTEXT_TOOL.to_owned(),
            description: "Read a context value by key from the internal scope or context packet."
                .to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {"key": {"type": "string"}},
                "required": ["key"],
            }),
        }];

        if self.context_provider.is_some()
            && self.metrics().retrieval_rounds_used < self.config.max_retrieval_rounds
        {
            tools.push(ToolDefinition {
                name: REQUEST_RETRIEVAL_TOOL.to_owned(),
                description: "Request external retrievals as 'prefix:payload' directives."
                    .to_owned(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "directives": {"type": "array", "items": {"type": "string"}},
                    },
                    "required": ["directives"],
                }),
            });
        }

        tools.extend(ctx.tool_definitions(&self.config.allowed_tools));
        tools
    }

    async fn execute_tool_calls(
        &self,
        ctx: &RunContext,
        response: &CompletionResponse,
        malformed_retries: &mut u32,
    ) -> Result<Vec<ContentPart>, NucleusError> {
        let mut results = Vec::new();
        for (call_id, name, input) in response.tool_uses() {
            let result = match name {
                QUERY_CONTEXT_TOOL => self.query_context(input),
                REQUEST_RETRIEVAL_TOOL => self.request_retrieval(input).await,
                _ => self.call_task_tool(ctx, name, input).await,
            };

            let part = match result {
                Ok(content) => ContentPart::ToolResult {
                    tool_use_id: call_id.to_owned(),
                    content,
                    is_error: false,
                },
                Err(ToolCallFailure::Recoverable(message)) => ContentPart::ToolResult {
                    tool_use_id: call_id.to_owned(),
                    content: message,
                    is_error: true,
                },
                Err(ToolCallFailure::Malformed(message)) => {
                    self.ledger.append(
                        EntryType::Error,
                        json!({
                            "taskId": self.task_id,
                            "stage": "nucleus_tool_call",
                            "tool": name,
                            "message": message,
                        }),
                    );
                    *malformed_retries = malformed_retries.saturating_add(1);
                    if *malformed_retries > MAX_MALFORMED_RETRIES {
                        return Err(NucleusError::MalformedToolCall {
                            tool: name.to_owned(),
                            retries: MAX_MALFORMED_RETRIES,
                            message,
                        });
                    }
                    ContentPart::ToolResult {
                        tool_use_id: call_id.to_owned(),
                        content: format!("malformed tool call: {message}. Fix the payload and retry."),
                        is_error: true,
                    }
                }
            };
            results.push(part);
        }
        Ok(results)
    }

    fn query_context(&self, input: &Value) -> Result<String, ToolCallFailure> {
        let key = input
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolCallFailure::Malformed("query_context requires a string 'key'".to_owned()))?;

        let value = self
            .scope
            .get(key)
            .or_else(|| self.packet.facts.get(key).cloned());
        match value {
            Some(value) => Ok(serde_json::to_string(&value).unwrap_or_else(|_| "null".to_owned())),
            None => Ok(format!("no context value under key {key:?}")),
        }
    }

    async fn request_retrieval(&self, input: &Value) -> Result<String, ToolCallFailure> {
        let Some(provider) = &self.context_provider else {
            return Err(ToolCallFailure::Recoverable(
                "no context provider configured; work with the available context".to_owned(),
            ));
        };
        if self.metrics().retrieval_rounds_used >= self.config.max_retrieval_rounds {
            return Err(ToolCallFailure::Recoverable(
                "retrieval round budget spent; work with the available context".to_owned(),
            ));
        }

        let raw: Vec<String> = match input.get("directives").and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect(),
            None => input
                .get("directive")
                .and_then(Value::as_str)
                .map(|s| vec![s.to_owned()])
                .unwrap_or_default(),
        };
        if raw.is_empty() {
            return Err(ToolCallFailure::Malformed(
                "request_context_retrieval requires a 'directives' array".to_owned(),
            ));
        }

        let mut directives = Vec::new();
        for item in &raw {
            directives.push(
                RetrievalDirective::parse(item)
                    .map_err(|e| ToolCallFailure::Malformed(e.to_string()))?,
            );
        }

        let report = provider.fulfill(&directives, &self.scope, &self.ledger).await;
        self.bump_retrieval_rounds();

        Ok(format!(
            "retrieved {} artifact group(s); {} directive(s) failed; scope keys now: {}",
            report.fulfilled.len(),
            report.failed.len(),
            self.scope.keys().join(", "),
        ))
    }

    async fn call_task_tool(
        &self,
        ctx: &RunContext,
        name: &str,
        input: &Value,
    ) -> Result<String, ToolCallFailure> {
        if !self.config.allowed_tools.iter().any(|t| t == name) {
            return Err(ToolCallFailure::Recoverable(format!(
                "tool {name:?} is not in this task's allowance"
            )));
        }
        let tool = ctx
            .tool(name)
            .map_err(|e| ToolCallFailure::Recoverable(e.to_string()))?;
        match tool.call(input.clone(), None).await {
            Ok(output) => {
                Ok(serde_json::to_string(&output).unwrap_or_else(|_| "null".to_owned()))
            }
            Err(e) => Err(ToolCallFailure::Recoverable(e.to_string())),
        }
    }

    // -- postcheck ----------------------------------------------------------

    /// Judge a task output against its success criteria.
    ///
    /// # Errors
    ///
    /// Returns [`NucleusError`] on transport failure.
    pub async fn postcheck(
        &self,
        task: &TaskSpec,
        output: &Value,
    ) -> Result<PostcheckOutcome, NucleusError> {
        if !self.config.postcheck_enabled {
            return Ok(PostcheckOutcome::Complete);
        }

        let prompt = prompt::postcheck_prompt(task, output);
        let response = self.single_round("postcheck", &prompt).await?;
        let text = response.text();

        let Some(verdict) = extract_json(&text) else {
            warn!(task_id = %self.task_id, "unparseable postcheck verdict, accepting output");
            return Ok(PostcheckOutcome::Complete);
        };

        let reason = verdict
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("(no reason given)")
            .to_owned();
        match verdict.get("verdict").and_then(Value::as_str) {
            Some("NEEDS_COMPENSATION") => Ok(PostcheckOutcome::NeedsCompensation { reason }),
            Some("ESCALATE") => Ok(PostcheckOutcome::Escalate { reason }),
            _ => Ok(PostcheckOutcome::Complete),
        }
    }

    // -- summaries ----------------------------------------------------------

    /// One no-tools round, used for the goal summary and the planner's
    /// thinking/emit stages. `phase` labels the `NUCLEUS_INFERENCE` entry.
    ///
    /// # Errors
    ///
    /// Returns [`NucleusError::Provider`] on transport failure.
    pub async fn summarize(&self, phase: &str, opening: &str) -> Result<String, NucleusError> {
        let response = self.single_round(phase, opening).await?;
        Ok(response.text())
    }

    async fn single_round(
        &self,
        phase: &str,
        opening: &str,
    ) -> Result<CompletionResponse, NucleusError> {
        let system = prompt::system_prompt(&self.visible_keys());
        let messages = vec![Message::user(opening.to_owned())];

        self.bump_tokens(estimate_request(&system, &messages));
        let rendered = render_conversation(&system, &messages);
        self.record_round(phase, &digest_text(&rendered), "");

        let response = self
            .provider
            .complete(CompletionRequest {
                messages,
                system: Some(system),
                tools: Vec::new(),
                max_tokens: Some(self.config.max_answer_tokens),
            })
            .await?;
        self.bump_rounds();
        Ok(response)
    }

    // -- state --------------------------------------------------------------

    fn bump_tokens(&self, amount: u64) -> u64 {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.estimated_prompt_tokens = state.estimated_prompt_tokens.saturating_add(amount);
        state.estimated_prompt_tokens
    }

    fn bump_rounds(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.rounds = state.rounds.saturating_add(1);
        }
    }

    fn bump_retrieval_rounds(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.retrieval_rounds_used = state.retrieval_rounds_used.saturating_add(1);
        }
    }

    fn mark_budget_exhausted(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.budget_exhausted = true;
        }
    }
}

enum ToolCallFailure {
    /// Fed back to the model as an error tool result.
    Recoverable(String),
    /// Counted against the malformed-call retry budget.
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn budget_threshold(max_context_tokens: u64) -> u64 {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        ((max_context_tokens as f64) * BUDGET_FORCE_RATIO).ceil() as u64
    }
}

fn estimate_request(system: &str, messages: &[Message]) -> u64 {
    let mut total = tokens::estimate(system);
    for message in messages {
        for part in &message.content {
            let text = match part {
                ContentPart::Text { text } => text.clone(),
                ContentPart::ToolUse { name, input, .. } => {
                    format!("{name} {input}")
                }
                ContentPart::ToolResult { content, .. } => content.clone(),
            };
            total = total.saturating_add(tokens::estimate(&text));
        }
    }
    total
}

fn render_conversation(system: &str, messages: &[Message]) -> String {
    let mut out = system.to_owned();
    for message in messages {
        out.push('\n');
        out.push_str(&message.text());
    }
    out
}

fn preview(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_owned();
    }
    let shortened: String = text.chars().take(limit).collect();
    format!("{shortened}…")
}

/// Lenient JSON extraction: direct parse, then fenced block, then the
/// first balanced object.
pub(crate) fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start.saturating_add(3)..];
        let body_start = after.find('\n').map(|i| i.saturating_add(1)).unwrap_or(0);
        if let Some(end) = after[body_start..].find("```") {
            let body = &after[body_start..body_start.saturating_add(end)];
            if let Ok(value) = serde_json::from_str::<Value>(body.trim()) {
                return Some(value);
            }
        }
    }

    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in trimmed[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth = depth.saturating_add(1),
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = start.saturating_add(offset).saturating_add(1);
                    return serde_json::from_str(&trimmed[start..end]).ok();
                }
            }
            _ => {}
        }
    }
    None
}
