//! Context packets, task-local internal scopes, and retrieval fulfillment.
//!
//! A [`ContextPacket`] is the immutable facts-and-assumptions snapshot a run
//! is planned and executed against; it is content-addressed by
//! [`ContextPacket::context_ref`]. Artifacts fetched mid-run are promoted
//! into a per-task [`InternalScope`]; the packet itself is never mutated.
//!
//! Retrieval requests travel as [`RetrievalDirective`]s, opaque
//! `prefix:payload` strings emitted by the nucleus. The
//! [`ToolContextProvider`] resolves each directive through a retrieval tool
//! registered for its prefix and records every promotion in the ledger.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::digest::digest_value;
use crate::ledger::{EntryType, Ledger};
use crate::tools::Tool;

// ---------------------------------------------------------------------------
// ContextPacket
// ---------------------------------------------------------------------------

/// Immutable facts-and-assumptions snapshot shared by planner and runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPacket {
    /// Stable packet identifier.
    #[serde(default)]
    pub id: String,
    /// Optional caller-assigned packet version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Ground-truth facts keyed by name. Ordered map so the content
    /// digest is stable.
    #[serde(default)]
    pub facts: BTreeMap<String, Value>,
    /// Assumptions the caller is making but has not verified.
    #[serde(default)]
    pub assumptions: Vec<String>,
}

impl ContextPacket {
    /// Build an empty packet with a generated id.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ..Self::default()
        }
    }

    /// Insert a fact, builder style.
    #[must_use]
    pub fn with_fact(mut self, key: impl Into<String>, value: Value) -> Self {
        self.facts.insert(key.into(), value);
        self
    }

    /// Record an assumption, builder style.
    #[must_use]
    pub fn with_assumption(mut self, assumption: impl Into<String>) -> Self {
        self.assumptions.push(assumption.into());
        self
    }

    /// Assign a fresh UUID if the id is empty. Returns whether it changed.
    pub fn normalize_id(&mut self) -> bool {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
            return true;
        }
        false
    }

    /// Content-addressable reference: SHA-256 over the canonical JSON of
    /// the normalized packet. Plans are stamped with this value and the
    /// runtime rejects a packet whose ref no longer matches.
    pub fn context_ref(&self) -> String {
        let normalized = serde_json::to_value(self).unwrap_or(Value::Null);
        digest_value(&normalized)
    }

    /// Names of all packet facts, sorted. Used for prompt grounding.
    pub fn fact_keys(&self) -> Vec<String> {
        self.facts.keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// InternalScope
// ---------------------------------------------------------------------------

/// Per-task mutable store of retrieved artifacts.
///
/// Owned exclusively by one task's nucleus for the duration of that task;
/// never promoted back into the shared [`ContextPacket`]. Cloning shares
/// the underlying map.
#[derive(Debug, Clone, Default)]
pub struct InternalScope {
    entries: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl InternalScope {
    /// Create an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an artifact.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        if let Ok(mut map) = self.entries.lock() {
            map.insert(key.into(), value);
        }
    }

    /// Read an artifact by key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().ok().and_then(|map| map.get(key).cloned())
    }

    /// All artifact keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of artifacts held.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// Whether the scope holds no artifacts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the scope as a plain map.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.lock().map(|map| map.clone()).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Retrieval directives
// ---------------------------------------------------------------------------

/// A parsed `prefix:payload` retrieval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalDirective {
    /// Routing prefix, e.g. `kb` or `code-search`.
    pub prefix: String,
    /// Opaque payload handed to the retrieval tool.
    pub payload: String,
    /// The original unparsed directive string.
    pub raw: String,
}

impl RetrievalDirective {
    /// Parse a directive of the form `prefix:payload`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::MalformedDirective`] when the separator is
    /// missing or the prefix is empty.
    pub fn parse(raw: &str) -> Result<Self, ContextError> {
        let (prefix, payload) = raw
            .split_once(':')
            .ok_or_else(|| ContextError::MalformedDirective(raw.to_owned()))?;
        if prefix.trim().is_empty() {
            return Err(ContextError::MalformedDirective(raw.to_owned()));
        }
        Ok(Self {
            prefix: prefix.trim().to_owned(),
            payload: payload.trim().to_owned(),
            raw: raw.to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Context retrieval errors.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Directive did not match the `prefix:payload` convention.
    #[error("malformed retrieval directive: {0:?} (expected 'prefix:payload')")]
    MalformedDirective(String),
    /// No retrieval tool is registered for the directive prefix.
    #[error("no retrieval tool registered for prefix {0:?}")]
    UnknownPrefix(String),
    /// The retrieval tool itself failed.
    #[error("retrieval tool {tool} failed: {message}")]
    RetrievalFailed {
        /// Tool that was routed to.
        tool: String,
        /// Underlying failure text.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// ContextProvider
// ---------------------------------------------------------------------------

/// Outcome of one fulfillment pass over a set of directives.
#[derive(Debug, Clone, Default)]
pub struct FulfillmentReport {
    /// Raw directives whose artifacts were promoted into the scope.
    pub fulfilled: Vec<String>,
    /// Raw directives that could not be resolved, with the failure reason.
    pub failed: Vec<(String, String)>,
}

impl FulfillmentReport {
    /// Whether every directive was resolved.
    pub fn complete(&self) -> bool {
        self.failed.is_empty() && !self.fulfilled.is_empty()
    }
}

/// Resolves retrieval directives into artifacts promoted into a task's
/// internal scope. The runtime invokes this at most once per task.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Fulfill `directives`, writing artifacts into `scope` and recording
    /// every promotion (or failure) as a `CONTEXT_INTERNALIZED` entry.
    async fn fulfill(
        &self,
        directives: &[RetrievalDirective],
        scope: &InternalScope,
        ledger: &Ledger,
    ) -> FulfillmentReport;
}

// ---------------------------------------------------------------------------
// ToolContextProvider
// ---------------------------------------------------------------------------

/// Routes each directive prefix to a registered retrieval tool.
///
/// The tool receives `{"payload", "directive"}` and returns either a bare
/// artifact (stored under the raw directive string) or an object with an
/// `artifacts` map whose entries are promoted individually.
#[derive(Default)]
pub struct ToolContextProvider {
    retrievers: BTreeMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolContextProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContextProvider")
            .field("prefixes", &self.retrievers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolContextProvider {
    /// Create a provider with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a retrieval tool for a directive prefix, builder style.
    #[must_use]
    pub fn with_route(mut self, prefix: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        self.retrievers.insert(prefix.into(), tool);
        self
    }

    /// Register a retrieval tool for a directive prefix.
    pub fn register(&mut self, prefix: impl Into<String>, tool: Arc<dyn Tool>) {
        self.retrievers.insert(prefix.into(), tool);
    }

    async fn resolve_one(
        &self,
        directive: &RetrievalDirective,
        scope: &InternalScope,
    ) -> Result<Vec<String>, ContextError> {
        let tool = self
            .retrievers
            .get(&directive.prefix)
            .ok_or_else(|| ContextError::UnknownPrefix(directive.prefix.clone()))?;

        let input = json!({
            "payload": directive.payload,
            "directive": directive.raw,
        });

        let artifact = tool.call(input, None).await.map_err(|e| {
            ContextError::RetrievalFailed {
                tool: tool.name().to_owned(),
                message: e.to_string(),
            }
        })?;

        // An `artifacts` object promotes each entry under its own key;
        // anything else lands under the raw directive string.
        let mut promoted = Vec::new();
        match artifact.get("artifacts").and_then(Value::as_object) {
            Some(map) => {
                for (key, value) in map {
                    scope.insert(key.clone(), value.clone());
                    promoted.push(key.clone());
                }
            }
            None => {
                scope.insert(directive.raw.clone(), artifact);
                promoted.push(directive.raw.clone());
            }
        }
        Ok(promoted)
    }
}

#[async_trait]
impl ContextProvider for ToolContextProvider {
    async fn fulfill(
        &self,
        directives: &[RetrievalDirective],
        scope: &InternalScope,
        ledger: &Ledger,
    ) -> FulfillmentReport {
        let mut report = FulfillmentReport::default();

        for directive in directives {
            match self.resolve_one(directive, scope).await {
                Ok(keys) => {
                    debug!(directive = %directive.raw, count = keys.len(), "context internalized");
                    ledger.append(
                        EntryType::ContextInternalized,
                        json!({
                            "directive": directive.raw,
                            "status": "fulfilled",
                            "keys": keys,
                        }),
                    );
                    report.fulfilled.push(directive.raw.clone());
                }
                Err(e) => {
                    warn!(directive = %directive.raw, error = %e, "context retrieval failed");
                    ledger.append(
                        EntryType::ContextInternalized,
                        json!({
                            "directive": directive.raw,
                            "status": "failed",
                            "error": e.to_string(),
                        }),
                    );
                    report.failed.push((directive.raw.clone(), e.to_string()));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_ref_is_stable_across_clones() {
        let packet = ContextPacket::new()
            .with_fact("region", json!("eu-west-1"))
            .with_fact("tier", json!("prod"))
            .with_assumption("billing data is current");
        assert_eq!(packet.context_ref(), packet.clone().context_ref());
    }

    #[test]
    fn context_ref_changes_with_facts() {
        let a = ContextPacket::new().with_fact("k", json!(1));
        let mut b = a.clone();
        b.facts.insert("k".to_owned(), json!(2));
        assert_ne!(a.context_ref(), b.context_ref());
    }

    #[test]
    fn directive_parse_splits_on_first_colon() {
        let d = RetrievalDirective::parse("kb:doc:with:colons").expect("parse");
        assert_eq!(d.prefix, "kb");
        assert_eq!(d.payload, "doc:with:colons");
        assert_eq!(d.raw, "kb:doc:with:colons");
    }

    #[test]
    fn directive_parse_rejects_missing_separator() {
        assert!(RetrievalDirective::parse("no-separator").is_err());
        assert!(RetrievalDirective::parse(":payload-only").is_err());
    }

    #[test]
    fn internal_scope_round_trips() {
        let scope = InternalScope::new();
        assert!(scope.is_empty());
        scope.insert("kb:doc-1", json!({"body": "text"}));
        assert_eq!(scope.len(), 1);
        assert_eq!(scope.get("kb:doc-1"), Some(json!({"body": "text"})));
        assert_eq!(scope.keys(), vec!["kb:doc-1".to_owned()]);
    }
}
