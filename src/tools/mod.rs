//! Tool abstraction and registry.
//!
//! A [`Tool`] is a named, schema-described callable a task body (or the
//! nucleus, on the model's behalf) may invoke. Tools are registered once in
//! a [`ToolRegistry`]; at execution time the runtime hands tasks
//! [`envelope::LedgeredTool`] wrappers so every call is recorded in the
//! decision ledger.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::providers::ToolDefinition;

pub mod envelope;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by tool implementations and the registry.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The input did not match the tool's expectations.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The tool ran but failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    /// No tool with the requested name is registered.
    #[error("unknown tool: {0}")]
    NotFound(String),
}

impl ToolError {
    /// Short machine-readable code used in tool-call envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::NotFound(_) => "not_found",
        }
    }
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A callable unit of work offered to tasks and to the model.
///
/// Implementations must be `Send + Sync`; the runtime shares them behind
/// `Arc` across task pipelines.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (must match registry registration).
    fn name(&self) -> &str;

    /// Description shown to the model when the tool is offered.
    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema for the tool input, when declared.
    fn input_schema(&self) -> Option<Value> {
        None
    }

    /// JSON Schema for the tool output, when declared.
    fn output_schema(&self) -> Option<Value> {
        None
    }

    /// Whether calling this tool mutates the outside world. Side-effectful
    /// tools should be called with an idempotency key so resumed runs can
    /// deduplicate.
    fn side_effects(&self) -> bool {
        false
    }

    /// Invoke the tool.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError`] on invalid input or execution failure.
    async fn call(&self, input: Value, idem_key: Option<&str>) -> Result<Value, ToolError>;

    /// Bridge to the provider-facing definition offered to the model.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_owned(),
            description: self.description().to_owned(),
            input_schema: self
                .input_schema()
                .unwrap_or_else(|| serde_json::json!({"type": "object"})),
        }
    }
}

// ---------------------------------------------------------------------------
// FnTool
// ---------------------------------------------------------------------------

/// Boxed future returned by closure-backed tools.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;

type ToolHandler = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// A [`Tool`] backed by a closure. The workhorse for embedding and tests.
#[derive(Clone)]
pub struct FnTool {
    name: String,
    description: String,
    input_schema: Option<Value>,
    side_effects: bool,
    handler: ToolHandler,
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("side_effects", &self.side_effects)
            .finish_non_exhaustive()
    }
}

impl FnTool {
    /// Wrap an async closure as a tool.
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> ToolFuture + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: None,
            side_effects: false,
            handler: Arc::new(handler),
        }
    }

    /// Wrap a synchronous closure as a tool.
    pub fn from_fn<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self::new(name, move |input| {
            let result = handler(input);
            Box::pin(async move { result })
        })
    }

    /// Set the model-facing description, builder style.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare the input schema, builder style.
    #[must_use]
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Mark the tool side-effectful, builder style.
    #[must_use]
    pub fn with_side_effects(mut self) -> Self {
        self.side_effects = true;
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Option<Value> {
        self.input_schema.clone()
    }

    fn side_effects(&self) -> bool {
        self.side_effects
    }

    async fn call(&self, input: Value, _idem_key: Option<&str>) -> Result<Value, ToolError> {
        (self.handler)(input).await
    }
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

/// Process-wide mapping from tool name to implementation.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.tools.read().map(|t| t.len()).unwrap_or(0);
        f.debug_struct("ToolRegistry").field("tool_count", &count).finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name, replacing any previous entry.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_owned();
        debug!(tool = %name, side_effects = tool.side_effects(), "tool registered");
        if let Ok(mut map) = self.tools.write() {
            map.insert(name, tool);
        }
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().ok().and_then(|map| map.get(name).cloned())
    }

    /// Whether a tool with this name is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.read().map(|map| map.contains_key(name)).unwrap_or(false)
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Number of registered tools.
    pub fn count(&self) -> usize {
        self.tools.read().map(|map| map.len()).unwrap_or(0)
    }

    /// Declared input schema for a tool, if any.
    pub fn input_schema(&self, name: &str) -> Option<Value> {
        self.get(name).and_then(|tool| tool.input_schema())
    }

    /// Declared output schema for a tool, if any.
    pub fn output_schema(&self, name: &str) -> Option<Value> {
        self.get(name).and_then(|tool| tool.output_schema())
    }

    /// Provider-facing definitions for a named subset of tools, in the
    /// order given. Unknown names are skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|name| self.get(name))
            .map(|tool| tool.definition())
            .collect()
    }
}
