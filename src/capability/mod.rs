//! Capability map: the typed catalog of work a planner may target.
//!
//! A [`Capability`] describes a unit of work (name, I/O schemas,
//! side-effect flag); the [`CapabilityRegistry`] binds each descriptor to a
//! [`TaskHandler`] implementation and carries the capability-map version
//! that plans are stamped with. Planners only emit tasks referencing
//! registered capabilities; the runtime rejects anything else before
//! execution.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::nucleus::NucleusError;
use crate::runtime::context::RunContext;
use crate::tools::ToolError;

// ---------------------------------------------------------------------------
// Capability descriptor
// ---------------------------------------------------------------------------

/// A named, schema-bound unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    /// Unique capability name.
    pub name: String,
    /// JSON Schema for task inputs, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// JSON Schema for task outputs, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Whether executing this capability mutates the outside world.
    #[serde(default)]
    pub side_effects: bool,
}

impl Capability {
    /// Pure (side-effect free) capability.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_schema: None,
            output_schema: None,
            side_effects: false,
        }
    }

    /// Declare the input schema, builder style.
    #[must_use]
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Declare the output schema, builder style.
    #[must_use]
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Mark the capability side-effectful, builder style.
    #[must_use]
    pub fn with_side_effects(mut self) -> Self {
        self.side_effects = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Task handler
// ---------------------------------------------------------------------------

/// Errors raised by task bodies. These are the retryable class: the
/// runtime re-attempts them per the task's retry contract before
/// promoting to a fatal run error.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task body failed.
    #[error("{0}")]
    Failed(String),
    /// A tool call inside the task failed.
    #[error(transparent)]
    Tool(#[from] ToolError),
    /// The task's nucleus invocation failed.
    #[error(transparent)]
    Nucleus(#[from] NucleusError),
}

/// Boxed future returned by task handlers.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send>>;

/// The execution body a capability resolves to at run time.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task against its run context and declared input.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`]; the runtime applies the retry contract.
    async fn execute(&self, ctx: RunContext, input: Value) -> Result<Value, TaskError>;
}

type HandlerFn = Arc<dyn Fn(RunContext, Value) -> TaskFuture + Send + Sync>;

/// A [`TaskHandler`] backed by a closure.
#[derive(Clone)]
pub struct FnTaskHandler {
    handler: HandlerFn,
}

impl std::fmt::Debug for FnTaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTaskHandler").finish_non_exhaustive()
    }
}

impl FnTaskHandler {
    /// Wrap an async closure as a handler.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(RunContext, Value) -> TaskFuture + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Wrap a synchronous closure as a handler.
    pub fn from_fn<F>(handler: F) -> Self
    where
        F: Fn(RunContext, Value) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        Self::new(move |ctx, input| {
            let result = handler(ctx, input);
            Box::pin(async move { result })
        })
    }
}

#[async_trait]
impl TaskHandler for FnTaskHandler {
    async fn execute(&self, ctx: RunContext, input: Value) -> Result<Value, TaskError> {
        (self.handler)(ctx, input).await
    }
}

/// The stock handler for LLM-mediated capabilities, installed by
/// [`CapabilityRegistry::register_llm`]. Drives the task's nucleus with
/// a prompt built from the task objective and input; the nucleus offers
/// the task's declared tools itself. Returns the model's final answer as
/// `{"answer", "rounds", "budgetExhausted"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlmTaskHandler;

#[async_trait]
impl TaskHandler for LlmTaskHandler {
    async fn execute(&self, ctx: RunContext, input: Value) -> Result<Value, TaskError> {
        let prompt = crate::nucleus::prompt::task_prompt(&ctx.task, &input);
        let outcome = ctx.nucleus.invoke(&ctx, &prompt).await?;
        Ok(serde_json::json!({
            "answer": outcome.text,
            "rounds": outcome.metrics.rounds,
            "budgetExhausted": outcome.metrics.budget_exhausted,
        }))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Default capability-map version for a freshly built registry.
pub const DEFAULT_MAP_VERSION: &str = "v1";

struct Registration {
    capability: Capability,
    handler: Arc<dyn TaskHandler>,
}

/// The versioned capability map.
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, Registration>>,
    version: RwLock<String>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            version: RwLock::new(DEFAULT_MAP_VERSION.to_owned()),
        }
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.entries.read().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("CapabilityRegistry")
            .field("capability_count", &count)
            .field("version", &self.version())
            .finish()
    }
}

impl CapabilityRegistry {
    /// Create an empty registry at [`DEFAULT_MAP_VERSION`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability with its handler, replacing any previous
    /// entry of the same name.
    pub fn register(&self, capability: Capability, handler: Arc<dyn TaskHandler>) {
        debug!(capability = %capability.name, "capability registered");
        if let Ok(mut map) = self.entries.write() {
            map.insert(
                capability.name.clone(),
                Registration { capability, handler },
            );
        }
    }

    /// Register an LLM-mediated capability: its task body is the stock
    /// [`LlmTaskHandler`], which answers through the per-task nucleus.
    pub fn register_llm(&self, capability: Capability) {
        self.register(capability, Arc::new(LlmTaskHandler));
    }

    /// Resolve a capability name to its descriptor and handler.
    pub fn resolve(&self, name: &str) -> Option<(Capability, Arc<dyn TaskHandler>)> {
        self.entries
            .read()
            .ok()
            .and_then(|map| {
                map.get(name)
                    .map(|r| (r.capability.clone(), Arc::clone(&r.handler)))
            })
    }

    /// Look up a capability descriptor.
    pub fn get(&self, name: &str) -> Option<Capability> {
        self.entries
            .read()
            .ok()
            .and_then(|map| map.get(name).map(|r| r.capability.clone()))
    }

    /// Whether a capability with this name is registered.
    pub fn has(&self, name: &str) -> bool {
        self.entries.read().map(|map| map.contains_key(name)).unwrap_or(false)
    }

    /// All capability descriptors, sorted by name. This is what the
    /// planner enumerates into its prompt.
    pub fn list(&self) -> Vec<Capability> {
        let mut capabilities: Vec<Capability> = self
            .entries
            .read()
            .map(|map| map.values().map(|r| r.capability.clone()).collect())
            .unwrap_or_default();
        capabilities.sort_by(|a, b| a.name.cmp(&b.name));
        capabilities
    }

    /// Number of registered capabilities.
    pub fn count(&self) -> usize {
        self.entries.read().map(|map| map.len()).unwrap_or(0)
    }

    /// Declared input schema for a capability, if any.
    pub fn input_schema(&self, name: &str) -> Option<Value> {
        self.get(name).and_then(|c| c.input_schema)
    }

    /// Declared output schema for a capability, if any.
    pub fn output_schema(&self, name: &str) -> Option<Value> {
        self.get(name).and_then(|c| c.output_schema)
    }

    /// Current capability-map version.
    pub fn version(&self) -> String {
        self.version
            .read()
            .map(|v| v.clone())
            .unwrap_or_else(|_| DEFAULT_MAP_VERSION.to_owned())
    }

    /// Bump the capability-map version. Plans stamped with an older
    /// version are rejected by the runtime.
    pub fn set_version(&self, version: impl Into<String>) {
        if let Ok(mut v) = self.version.write() {
            *v = version.into();
        }
    }
}
