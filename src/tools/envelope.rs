//! Ledgered tool-call envelopes.
//!
//! The runtime never hands a task a raw tool: [`LedgeredTool`] preserves
//! the inner tool's identity and wraps every `call` in a
//! [`ToolEnvelope`]: a `TOOL_CALL{stage: start}` entry before the call,
//! then exactly one `complete` (with output and duration) or `error`
//! (with code and message) entry sharing the same envelope id.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::digest::digest_value;
use crate::ledger::{EntryType, Ledger};

use super::{Tool, ToolError};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Timing and provenance recorded with every tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    /// Milliseconds since the Unix epoch at call start.
    pub timestamp: i64,
    /// SHA-256 over the canonical input value.
    pub input_digest: String,
    /// Wall-clock duration, present on `complete` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Structured record of a single tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEnvelope {
    /// Envelope identity: the caller's idempotency key when supplied,
    /// otherwise `taskId-toolName-ts-suffix`.
    pub id: String,
    /// Name of the invoked tool.
    pub name: String,
    /// Input value as passed.
    pub input: Value,
    /// Output value, present after a successful call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure record `{code, message}`, present after a failed call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Timing and digest metadata.
    pub metadata: EnvelopeMetadata,
}

fn envelope_id(task_id: &str, tool_name: &str, ts: i64, idem_key: Option<&str>) -> String {
    if let Some(key) = idem_key {
        return key.to_owned();
    }
    let suffix: u16 = rand::thread_rng().gen();
    format!("{task_id}-{tool_name}-{ts}-{suffix:04x}")
}

// ---------------------------------------------------------------------------
// LedgeredTool
// ---------------------------------------------------------------------------

/// A [`Tool`] wrapper that emits envelope entries around every call.
///
/// Identity (name, schemas, side-effect flag) is forwarded unchanged, so
/// a wrapped tool is indistinguishable from the inner one at the seam.
pub struct LedgeredTool {
    inner: Arc<dyn Tool>,
    ledger: Arc<Ledger>,
    task_id: String,
}

impl std::fmt::Debug for LedgeredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgeredTool")
            .field("tool", &self.inner.name())
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl LedgeredTool {
    /// Wrap `inner` so calls are attributed to `task_id` in `ledger`.
    pub fn new(inner: Arc<dyn Tool>, ledger: Arc<Ledger>, task_id: impl Into<String>) -> Self {
        Self {
            inner,
            ledger,
            task_id: task_id.into(),
        }
    }
}

#[async_trait]
impl Tool for LedgeredTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn input_schema(&self) -> Option<Value> {
        self.inner.input_schema()
    }

    fn output_schema(&self) -> Option<Value> {
        self.inner.output_schema()
    }

    fn side_effects(&self) -> bool {
        self.inner.side_effects()
    }

    async fn call(&self, input: Value, idem_key: Option<&str>) -> Result<Value, ToolError> {
        let ts = Utc::now().timestamp_millis();
        let mut envelope = ToolEnvelope {
            id: envelope_id(&self.task_id, self.inner.name(), ts, idem_key),
            name: self.inner.name().to_owned(),
            input: input.clone(),
            output: None,
            error: None,
            metadata: EnvelopeMetadata {
                timestamp: ts,
                input_digest: digest_value(&input),
                duration_ms: None,
            },
        };

        self.ledger.append(
            EntryType::ToolCall,
            json!({
                "stage": "start",
                "taskId": self.task_id,
                "envelope": envelope,
            }),
        );

        let started = Instant::now();
        match self.inner.call(input, idem_key).await {
            Ok(output) => {
                envelope.output = Some(output.clone());
                envelope.metadata.duration_ms =
                    Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
                self.ledger.append(
                    EntryType::ToolCall,
                    json!({
                        "stage": "complete",
                        "taskId": self.task_id,
                        "envelope": envelope,
                    }),
                );
                Ok(output)
            }
            Err(e) => {
                envelope.error = Some(json!({
                    "code": e.code(),
                    "message": e.to_string(),
                }));
                self.ledger.append(
                    EntryType::ToolCall,
                    json!({
                        "stage": "error",
                        "taskId": self.task_id,
                        "envelope": envelope,
                    }),
                );
                Err(e)
            }
        }
    }
}
