//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use straylight::capability::{Capability, CapabilityRegistry, FnTaskHandler, TaskError};
use straylight::context::ContextPacket;
use straylight::ledger::{EntryType, Ledger, LedgerEntry};
use straylight::plan::{Edge, Plan, TaskSpec};
use straylight::providers::scripted::ScriptedProvider;
use straylight::runtime::Scheduler;
use straylight::tools::ToolRegistry;
use straylight::types::Goal;

/// A goal all runtime tests share.
pub fn goal() -> Goal {
    Goal::new("exercise the runtime")
}

/// A packet with a couple of facts.
pub fn packet() -> ContextPacket {
    ContextPacket::new()
        .with_fact("tier", json!("prod"))
        .with_fact("region", json!("eu-west-1"))
}

/// Registry where every capability echoes `{taskId, input, ok: true}`.
pub fn echo_registry(names: &[&str]) -> Arc<CapabilityRegistry> {
    let registry = Arc::new(CapabilityRegistry::new());
    for name in names {
        register_echo(&registry, name);
    }
    registry
}

/// Register one echoing capability.
pub fn register_echo(registry: &Arc<CapabilityRegistry>, name: &str) {
    registry.register(
        Capability::new(name),
        Arc::new(FnTaskHandler::from_fn(|ctx, input| {
            Ok(json!({"taskId": ctx.task.id, "input": input, "ok": true}))
        })),
    );
}

/// Register a capability that fails its first `failures` attempts, then
/// echoes. The counter is shared so tests can assert attempt counts.
pub fn register_flaky(
    registry: &Arc<CapabilityRegistry>,
    name: &str,
    failures: u32,
) -> Arc<AtomicU32> {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    registry.register(
        Capability::new(name),
        Arc::new(FnTaskHandler::from_fn(move |ctx, _input| {
            let attempt = seen.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            if attempt <= failures {
                Err(TaskError::Failed(format!("induced failure #{attempt}")))
            } else {
                Ok(json!({"taskId": ctx.task.id, "ok": true, "attempt": attempt}))
            }
        })),
    );
    attempts
}

/// Stamp a plan against the packet and registry it will run with.
pub fn stamp(mut plan: Plan, packet: &ContextPacket, registry: &CapabilityRegistry) -> Plan {
    plan.context_ref = packet.context_ref();
    plan.capability_map_version = registry.version();
    plan
}

/// `t1 -> t2 -> t3`, all on the `work` capability, no guards.
pub fn linear_plan() -> Plan {
    Plan::new("linear")
        .with_task(TaskSpec::new("t1", "work"))
        .with_task(TaskSpec::new("t2", "work"))
        .with_task(TaskSpec::new("t3", "work"))
        .with_edge(Edge::new("t1", "t2"))
        .with_edge(Edge::new("t2", "t3"))
}

/// Diamond: `t1 -> {t2, t3} -> t4`.
pub fn diamond_plan() -> Plan {
    Plan::new("diamond")
        .with_task(TaskSpec::new("t1", "work"))
        .with_task(TaskSpec::new("t2", "work"))
        .with_task(TaskSpec::new("t3", "work"))
        .with_task(TaskSpec::new("t4", "work"))
        .with_edge(Edge::new("t1", "t2"))
        .with_edge(Edge::new("t1", "t3"))
        .with_edge(Edge::new("t2", "t4"))
        .with_edge(Edge::new("t3", "t4"))
}

/// A scheduler over the standard fixtures with a scripted provider.
pub fn scheduler_for(
    plan: Plan,
    registry: &Arc<CapabilityRegistry>,
    ledger: &Arc<Ledger>,
) -> Scheduler {
    straylight::logging::init_for_tests();
    let packet = packet();
    let plan = stamp(plan, &packet, registry);
    Scheduler::new(
        goal(),
        packet,
        plan,
        Arc::clone(registry),
        Arc::new(ToolRegistry::new()),
        Arc::new(ScriptedProvider::new().with_fallback("run summary")),
        Arc::clone(ledger),
        "run-1",
    )
}

/// Like [`scheduler_for`], but with explicit tools and transport.
pub fn scheduler_custom(
    plan: Plan,
    registry: &Arc<CapabilityRegistry>,
    tools: Arc<ToolRegistry>,
    provider: Arc<dyn straylight::providers::LlmProvider>,
    ledger: &Arc<Ledger>,
) -> Scheduler {
    straylight::logging::init_for_tests();
    let packet = packet();
    let plan = stamp(plan, &packet, registry);
    Scheduler::new(
        goal(),
        packet,
        plan,
        Arc::clone(registry),
        tools,
        provider,
        Arc::clone(ledger),
        "run-1",
    )
}

/// Register a capability whose handler drives the task nucleus and
/// reports the invocation telemetry as its output.
pub fn register_probe(registry: &Arc<CapabilityRegistry>, name: &str) {
    registry.register(
        Capability::new(name),
        Arc::new(FnTaskHandler::new(|ctx, input| {
            Box::pin(async move {
                let opening = input
                    .get("prompt")
                    .and_then(Value::as_str)
                    .unwrap_or("complete the task")
                    .to_owned();
                let outcome = ctx.nucleus.invoke(&ctx, &opening).await?;
                Ok(json!({
                    "text": outcome.text,
                    "rounds": outcome.metrics.rounds,
                    "estimatedPromptTokens": outcome.metrics.estimated_prompt_tokens,
                    "budgetExhausted": outcome.metrics.budget_exhausted,
                    "retrievalRoundsUsed": outcome.metrics.retrieval_rounds_used,
                }))
            })
        })),
    );
}

/// Entries of one type, in ledger order.
pub fn entries_of(ledger: &Ledger, entry_type: EntryType) -> Vec<LedgerEntry> {
    ledger.entries_by_type(entry_type)
}

/// Task ids named in `TASK_END` entries, in order.
pub fn ended_tasks(ledger: &Ledger) -> Vec<String> {
    entries_of(ledger, EntryType::TaskEnd)
        .iter()
        .filter_map(|e| e.details.get("taskId").and_then(Value::as_str).map(String::from))
        .collect()
}

/// Position of the first entry matching `entry_type` and `task_id`.
pub fn position_of(ledger: &Ledger, entry_type: EntryType, task_id: &str) -> Option<u64> {
    ledger
        .entries()
        .iter()
        .find(|e| {
            e.entry_type == entry_type
                && e.details.get("taskId").and_then(Value::as_str) == Some(task_id)
        })
        .map(|e| e.id)
}
