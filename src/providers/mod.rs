//! LLM gateway: the pluggable transport seam.
//!
//! The kernel never talks HTTP directly; everything model-facing goes
//! through [`LlmProvider`]. Two implementations ship here:
//! [`anthropic::AnthropicProvider`] (reference HTTP transport, messages
//! API with native tool calling) and [`scripted::ScriptedProvider`]
//! (deterministic canned responses for tests and demos). Concrete
//! deployments register their own transports against the same trait.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod anthropic;
pub mod scripted;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Human/runtime message.
    User,
    /// Model message.
    Assistant,
}

/// A single structured content part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// Tool invocation requested by the model.
    ToolUse {
        /// Unique call identifier.
        id: String,
        /// Tool name.
        name: String,
        /// Tool input as JSON.
        input: Value,
    },
    /// Result of a tool call, fed back to the model.
    ToolResult {
        /// Matching call identifier.
        tool_use_id: String,
        /// Result content, serialized.
        content: String,
        /// Whether the tool reported an error.
        is_error: bool,
    },
}

/// A message in a model conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author role.
    pub role: Role,
    /// Content parts.
    pub content: Vec<ContentPart>,
}

impl Message {
    /// A plain-text user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// An assistant message carrying the given parts.
    pub fn assistant(content: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// A user message carrying tool results.
    pub fn tool_results(results: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: results,
        }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// JSON Schema definition for a tool offered to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (must resolve in the tool registry or context-tool set).
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON Schema object for the tool's parameters.
    pub input_schema: Value,
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Conversation so far, latest message last.
    pub messages: Vec<Message>,
    /// System prompt injected ahead of the conversation.
    pub system: Option<String>,
    /// Tools the model may call this round.
    pub tools: Vec<ToolDefinition>,
    /// Maximum response tokens.
    pub max_tokens: Option<u32>,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Normal end of turn.
    EndTurn,
    /// The model wants tool results before continuing.
    ToolUse,
    /// Response token limit reached.
    MaxTokens,
    /// Transport-specific other reason.
    Other(String),
}

/// Token usage reported by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Prompt tokens consumed.
    pub input_tokens: u32,
    /// Response tokens generated.
    pub output_tokens: u32,
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Response parts (text and/or tool calls).
    pub content: Vec<ContentPart>,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Token usage, when the transport reports it.
    pub usage: UsageStats,
    /// Model identifier that served the response.
    pub model: String,
}

impl CompletionResponse {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// All tool-use parts in response order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by model transports.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP transport failure.
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Response did not match the expected schema.
    #[error("provider response parse error: {0}")]
    Parse(String),
    /// Upstream responded with an error status.
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
    /// The provider cannot serve the request as configured.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Check an HTTP response, returning the body or a structured error with
/// secrets scrubbed from the error body.
///
/// # Errors
///
/// Returns [`ProviderError::Request`] on transport failure,
/// [`ProviderError::HttpStatus`] on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_error_body(&body),
        });
    }
    Ok(body)
}

fn sanitize_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"Bearer [A-Za-z0-9._\-]{16,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened: String = sanitized.chars().take(MAX_ERROR_BODY_CHARS).collect();
        return format!("{shortened}...[truncated]");
    }
    sanitized
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The pluggable LLM transport.
///
/// Implementations must be `Send + Sync`; the nucleus shares one provider
/// across all tasks of a run.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Request a completion.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on API, network, or parse failure.
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Whether this transport supports native tool calling.
    fn supports_tool_calling(&self) -> bool;

    /// Model identifier this transport is bound to.
    fn model_id(&self) -> &str;
}
