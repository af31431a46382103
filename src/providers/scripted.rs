//! Deterministic scripted transport for tests and demos.
//!
//! Responses are queued up front and returned in order; every received
//! request is recorded for later assertions. When the queue runs dry the
//! provider returns a configurable fallback answer, so bounded loops
//! (nucleus rounds, goal summaries) always terminate in tests.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    CompletionRequest, CompletionResponse, ContentPart, LlmProvider, ProviderError, StopReason,
    UsageStats,
};

/// A canned response turn.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    content: Vec<ContentPart>,
    stop_reason: StopReason,
    usage: UsageStats,
}

impl ScriptedTurn {
    /// A terminal text answer.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentPart::Text { text: text.into() }],
            stop_reason: StopReason::EndTurn,
            usage: UsageStats::default(),
        }
    }

    /// A turn that calls one tool and waits for its result.
    pub fn tool_use(call_id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            content: vec![ContentPart::ToolUse {
                id: call_id.into(),
                name: name.into(),
                input,
            }],
            stop_reason: StopReason::ToolUse,
            usage: UsageStats::default(),
        }
    }

    /// Attach explicit content parts.
    #[must_use]
    pub fn with_parts(mut self, parts: Vec<ContentPart>) -> Self {
        self.content = parts;
        self
    }

    /// Attach usage numbers, builder style.
    #[must_use]
    pub fn with_usage(mut self, input_tokens: u32, output_tokens: u32) -> Self {
        self.usage = UsageStats {
            input_tokens,
            output_tokens,
        };
        self
    }
}

#[derive(Debug, Default)]
struct ScriptedState {
    queue: Vec<ScriptedTurn>,
    cursor: usize,
    requests: Vec<CompletionRequest>,
}

/// An [`LlmProvider`] that replays a fixed script.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    state: Mutex<ScriptedState>,
    fallback: String,
}

impl ScriptedProvider {
    /// Provider with an empty script; every call returns the fallback.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptedState::default()),
            fallback: "(scripted fallback)".to_owned(),
        }
    }

    /// Queue a script of turns, builder style.
    #[must_use]
    pub fn with_turns(self, turns: Vec<ScriptedTurn>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.queue = turns;
        }
        self
    }

    /// Override the exhausted-script fallback text, builder style.
    #[must_use]
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    /// Append a turn after construction.
    pub fn push(&self, turn: ScriptedTurn) {
        if let Ok(mut state) = self.state.lock() {
            state.queue.push(turn);
        }
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.state
            .lock()
            .map(|state| state.requests.clone())
            .unwrap_or_default()
    }

    /// Number of scripted turns consumed.
    pub fn consumed(&self) -> usize {
        self.state.lock().map(|state| state.cursor).unwrap_or(0)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ProviderError::Unavailable("scripted state poisoned".to_owned()))?;
        state.requests.push(request);

        let turn = state.queue.get(state.cursor).cloned();
        match turn {
            Some(turn) => {
                state.cursor = state.cursor.saturating_add(1);
                Ok(CompletionResponse {
                    content: turn.content,
                    stop_reason: turn.stop_reason,
                    usage: turn.usage,
                    model: "scripted".to_owned(),
                })
            }
            None => Ok(CompletionResponse {
                content: vec![ContentPart::Text {
                    text: self.fallback.clone(),
                }],
                stop_reason: StopReason::EndTurn,
                usage: UsageStats::default(),
                model: "scripted".to_owned(),
            }),
        }
    }

    fn supports_tool_calling(&self) -> bool {
        true
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}
