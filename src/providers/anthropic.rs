//! Reference HTTP transport: Anthropic messages API with native tool use.

use serde_json::{json, Value};
use url::Url;

use super::{
    check_http_response, CompletionRequest, CompletionResponse, ContentPart, LlmProvider, Message,
    ProviderError, Role, StopReason, UsageStats,
};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const MESSAGES_PATH: &str = "/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Anthropic messages API provider.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    model: String,
    api_key: String,
    endpoint: Url,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Provider against the public API base.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unavailable`] if the endpoint URL cannot
    /// be constructed (it can't, for the default base, but the custom-base
    /// path shares this constructor).
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_base_url(model, api_key, DEFAULT_API_BASE)
    }

    /// Provider against a custom base URL (proxies, gateways).
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unavailable`] on an invalid base URL.
    pub fn with_base_url(
        model: impl Into<String>,
        api_key: impl Into<String>,
        base_url: &str,
    ) -> Result<Self, ProviderError> {
        let base = Url::parse(base_url)
            .map_err(|e| ProviderError::Unavailable(format!("invalid base URL {base_url:?}: {e}")))?;
        let endpoint = base
            .join(MESSAGES_PATH)
            .map_err(|e| ProviderError::Unavailable(format!("invalid endpoint: {e}")))?;
        Ok(Self {
            model: model.into(),
            api_key: api_key.into(),
            endpoint,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let messages: Vec<Value> = request.messages.iter().map(encode_message).collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });

        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.input_schema,
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let payload = check_http_response(response).await?;
        let parsed: Value =
            serde_json::from_str(&payload).map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(CompletionResponse {
            content: decode_content(&parsed)?,
            stop_reason: decode_stop_reason(&parsed),
            usage: decode_usage(&parsed),
            model: parsed
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(&self.model)
                .to_owned(),
        })
    }

    fn supports_tool_calling(&self) -> bool {
        true
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

fn encode_message(message: &Message) -> Value {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    let content: Vec<Value> = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({"type": "text", "text": text}),
            ContentPart::ToolUse { id, name, input } => {
                json!({"type": "tool_use", "id": id, "name": name, "input": input})
            }
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
        })
        .collect();
    json!({"role": role, "content": content})
}

fn decode_content(value: &Value) -> Result<Vec<ContentPart>, ProviderError> {
    let Some(items) = value.get("content").and_then(Value::as_array) else {
        return Err(ProviderError::Parse("missing content array".to_owned()));
    };

    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match item.get("type").and_then(Value::as_str).unwrap_or_default() {
            "text" => parts.push(ContentPart::Text {
                text: item
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            }),
            "tool_use" => {
                let name = item
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProviderError::Parse("tool_use missing name".to_owned()))?
                    .to_owned();
                parts.push(ContentPart::ToolUse {
                    id: item
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                    name,
                    input: item.get("input").cloned().unwrap_or(Value::Null),
                });
            }
            // Thinking blocks and other part types are not surfaced.
            _ => {}
        }
    }
    Ok(parts)
}

fn decode_stop_reason(value: &Value) -> StopReason {
    match value.get("stop_reason").and_then(Value::as_str) {
        Some("end_turn") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(other) => StopReason::Other(other.to_owned()),
    }
}

fn decode_usage(value: &Value) -> UsageStats {
    let usage = value.get("usage");
    let read = |key: &str| -> u32 {
        usage
            .and_then(|u| u.get(key))
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };
    UsageStats {
        input_tokens: read("input_tokens"),
        output_tokens: read("output_tokens"),
    }
}
