//! Checkpointing and resume.

use std::sync::Arc;

use serde_json::json;

use crate::common::*;
use straylight::capability::{Capability, CapabilityRegistry, FnTaskHandler, TaskError};
use straylight::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use straylight::context::ContextPacket;
use straylight::ledger::{EntryType, Ledger};
use straylight::plan::{Plan, TaskSpec};
use straylight::providers::scripted::ScriptedProvider;
use straylight::runtime::{FailureStage, Scheduler};
use straylight::tools::ToolRegistry;

fn breaker_registry(broken: bool) -> Arc<CapabilityRegistry> {
    let registry = echo_registry(&["work"]);
    if broken {
        registry.register(
            Capability::new("breaker"),
            Arc::new(FnTaskHandler::from_fn(|_, _| {
                Err(TaskError::Failed("backend offline".to_owned()))
            })),
        );
    } else {
        register_echo(&registry, "breaker");
    }
    registry
}

fn chain_with_breaker() -> Plan {
    Plan::new("chain")
        .with_task(TaskSpec::new("t1", "work"))
        .with_task(TaskSpec::new("t2", "breaker"))
        .with_task(TaskSpec::new("t3", "work"))
        .with_edge(straylight::plan::Edge::new("t1", "t2"))
        .with_edge(straylight::plan::Edge::new("t2", "t3"))
}

fn build(
    packet: &ContextPacket,
    registry: &Arc<CapabilityRegistry>,
    ledger: &Arc<Ledger>,
    store: &Arc<MemoryCheckpointStore>,
) -> Scheduler {
    let plan = stamp(chain_with_breaker(), packet, registry);
    Scheduler::new(
        goal(),
        packet.clone(),
        plan,
        Arc::clone(registry),
        Arc::new(ToolRegistry::new()),
        Arc::new(ScriptedProvider::new().with_fallback("summary")),
        Arc::clone(ledger),
        "resume-run",
    )
    .with_checkpoint_store(Arc::clone(store) as Arc<dyn CheckpointStore>)
}

#[tokio::test]
async fn failed_run_resumes_and_completes() {
    let packet = packet();
    let store = Arc::new(MemoryCheckpointStore::new());

    // First run: t1 succeeds, t2 raises.
    let first_ledger = Arc::new(Ledger::new());
    let failure = build(&packet, &breaker_registry(true), &first_ledger, &store)
        .run()
        .await
        .expect_err("t2 fails");
    assert_eq!(failure.stage, FailureStage::Execute);
    assert_eq!(failure.task_id.as_deref(), Some("t2"));
    let resume_point = failure.checkpoint_id.expect("checkpoint before surfacing");

    // The failure checkpoint holds executed=[t1] and an ERROR entry.
    let checkpoint = store
        .get("resume-run", Some(resume_point.as_str()))
        .await
        .expect("stored checkpoint");
    assert_eq!(
        checkpoint.state.executed,
        std::collections::BTreeSet::from(["t1".to_owned()])
    );
    assert!(checkpoint
        .state
        .ledger
        .iter()
        .any(|e| e.entry_type == EntryType::Error));
    let original_t1 = checkpoint.state.outputs["t1"].clone();

    // Second run: fixed t2, resumed from the failure checkpoint.
    let second_ledger = Arc::new(Ledger::new());
    let result = build(&packet, &breaker_registry(false), &second_ledger, &store)
        .with_resume_from(resume_point)
        .run()
        .await
        .expect("resumed run completes");

    assert_eq!(result.executed.len(), 3);
    assert_eq!(result.outputs_by_task["t1"], original_t1);
    assert_eq!(result.outputs_by_task["t2"]["ok"], json!(true));

    // t1 did not re-execute: exactly one TASK_START for it across the
    // restored-plus-new ledger.
    let t1_starts = second_ledger
        .entries_by_type(EntryType::TaskStart)
        .iter()
        .filter(|e| e.details["taskId"] == "t1")
        .count();
    assert_eq!(t1_starts, 1);
    second_ledger.validate().expect("restored chain still validates");
}

#[tokio::test]
async fn resume_from_final_checkpoint_is_idempotent() {
    let packet = packet();
    let store = Arc::new(MemoryCheckpointStore::new());

    let first_ledger = Arc::new(Ledger::new());
    let first = build(&packet, &breaker_registry(false), &first_ledger, &store)
        .run()
        .await
        .expect("first run completes");
    let final_checkpoint = first.last_checkpoint_id.expect("final checkpoint");

    let second_ledger = Arc::new(Ledger::new());
    let second = build(&packet, &breaker_registry(false), &second_ledger, &store)
        .with_resume_from(final_checkpoint)
        .run()
        .await
        .expect("replay from the end is a no-op");

    assert_eq!(second.outputs_by_task, first.outputs_by_task);
    assert_eq!(second.executed, first.executed);
}

#[tokio::test]
async fn structurally_changed_plan_is_rejected_on_resume() {
    let packet = packet();
    let store = Arc::new(MemoryCheckpointStore::new());

    let first_ledger = Arc::new(Ledger::new());
    let failure = build(&packet, &breaker_registry(true), &first_ledger, &store)
        .run()
        .await
        .expect_err("t2 fails");
    let resume_point = failure.checkpoint_id.expect("checkpoint");

    // Same plan id, extra task: structural drift.
    let registry = breaker_registry(false);
    let drifted = stamp(
        chain_with_breaker().with_task(TaskSpec::new("t4", "work")),
        &packet,
        &registry,
    );
    let second_ledger = Arc::new(Ledger::new());
    let rejected = Scheduler::new(
        goal(),
        packet.clone(),
        drifted,
        registry,
        Arc::new(ToolRegistry::new()),
        Arc::new(ScriptedProvider::new()),
        second_ledger,
        "resume-run",
    )
    .with_checkpoint_store(Arc::clone(&store) as Arc<dyn CheckpointStore>)
    .with_resume_from(resume_point)
    .run()
    .await
    .expect_err("drifted plan rejected");

    assert_eq!(rejected.stage, FailureStage::Resume);
    assert!(rejected.message.contains("structurally"));
}

#[tokio::test]
async fn resume_without_store_is_rejected() {
    let packet = packet();
    let registry = breaker_registry(false);
    let ledger = Arc::new(Ledger::new());
    let plan = stamp(chain_with_breaker(), &packet, &registry);

    let failure = Scheduler::new(
        goal(),
        packet,
        plan,
        registry,
        Arc::new(ToolRegistry::new()),
        Arc::new(ScriptedProvider::new()),
        ledger,
        "no-store",
    )
    .with_resume_from("cp-anything")
    .run()
    .await
    .expect_err("no store to resume from");

    assert_eq!(failure.stage, FailureStage::Resume);
}

#[tokio::test]
async fn checkpoint_interval_batches_snapshots() {
    let packet = packet();
    let registry = echo_registry(&["work"]);
    let store = Arc::new(MemoryCheckpointStore::new());
    let ledger = Arc::new(Ledger::new());
    let plan = stamp(linear_plan(), &packet, &registry);

    Scheduler::new(
        goal(),
        packet,
        plan,
        registry,
        Arc::new(ToolRegistry::new()),
        Arc::new(ScriptedProvider::new()),
        ledger,
        "interval-run",
    )
    .with_checkpoint_store(Arc::clone(&store) as Arc<dyn CheckpointStore>)
    .with_checkpoint_interval(2)
    .run()
    .await
    .expect("run completes");

    // One snapshot after t2 (interval reached), one final after t3.
    let metas = store.list("interval-run").await.expect("list");
    assert_eq!(metas.len(), 2);
}
