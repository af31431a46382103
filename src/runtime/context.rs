//! Per-task run context.
//!
//! The runtime hands each task handler a [`RunContext`]: the goal and
//! packet, the task's own [`TaskSpec`] and nucleus, read access to
//! upstream outputs, and ledgered tool resolution. Cloning is cheap
//! (everything shared is behind `Arc`).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::capability::CapabilityRegistry;
use crate::context::{ContextPacket, InternalScope};
use crate::ledger::Ledger;
use crate::nucleus::Nucleus;
use crate::plan::TaskSpec;
use crate::providers::ToolDefinition;
use crate::stream::StreamSink;
use crate::tools::envelope::LedgeredTool;
use crate::tools::{Tool, ToolError, ToolRegistry};
use crate::types::Goal;

/// Shared map of completed task outputs. Write-once per task id.
pub(crate) type SharedOutputs = Arc<Mutex<BTreeMap<String, Value>>>;

/// Everything a task body may touch while executing.
#[derive(Clone)]
pub struct RunContext {
    /// The run's goal.
    pub goal: Arc<Goal>,
    /// The immutable context packet.
    pub packet: Arc<ContextPacket>,
    /// This task's spec.
    pub task: TaskSpec,
    /// This task's nucleus.
    pub nucleus: Arc<Nucleus>,
    /// This task's internal scope (shared with the nucleus).
    pub scope: InternalScope,
    pub(crate) outputs: SharedOutputs,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) capabilities: Arc<CapabilityRegistry>,
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) stream: Arc<dyn StreamSink>,
    pub(crate) context_ref: String,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("goal", &self.goal.id)
            .field("task", &self.task.id)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Resolve a tool, wrapped so every call is ledgered against this
    /// task.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::NotFound`] for unregistered names.
    pub fn tool(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        let inner = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_owned()))?;
        Ok(Arc::new(LedgeredTool::new(
            inner,
            Arc::clone(&self.ledger),
            self.task.id.clone(),
        )))
    }

    /// Provider-facing definitions for the named tools.
    pub fn tool_definitions(&self, names: &[String]) -> Vec<ToolDefinition> {
        self.tools.definitions_for(names)
    }

    /// Snapshot of all completed task outputs.
    pub fn outputs(&self) -> BTreeMap<String, Value> {
        self.outputs.lock().map(|map| map.clone()).unwrap_or_default()
    }

    /// Output of one upstream task, if it has completed.
    pub fn output_of(&self, task_id: &str) -> Option<Value> {
        self.outputs
            .lock()
            .ok()
            .and_then(|map| map.get(task_id).cloned())
    }

    /// The shared tool registry (unwrapped; prefer [`RunContext::tool`]).
    pub fn tool_registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.tools)
    }

    /// The capability registry the plan was validated against.
    pub fn capability_registry(&self) -> Arc<CapabilityRegistry> {
        Arc::clone(&self.capabilities)
    }

    /// The run ledger.
    pub fn ledger(&self) -> Arc<Ledger> {
        Arc::clone(&self.ledger)
    }

    /// Emit a progress event attributed to this task.
    pub fn emit(&self, payload: Value) {
        self.stream.emit("task", &self.task.id, payload);
    }

    /// Default idempotency key for side-effectful tool calls from this
    /// task: stable across a resume of the same plan and packet.
    pub fn idem_key(&self) -> String {
        self.task.idem_key(&self.context_ref)
    }
}
