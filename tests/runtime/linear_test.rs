//! Linear chain happy path and its ledger invariants.

use crate::common::*;
use straylight::ledger::EntryType;

#[tokio::test]
async fn linear_chain_executes_in_order() {
    let registry = echo_registry(&["work"]);
    let ledger = std::sync::Arc::new(straylight::ledger::Ledger::new());

    let result = scheduler_for(linear_plan(), &registry, &ledger)
        .run()
        .await
        .expect("linear run succeeds");

    // All three tasks produced output and were marked executed.
    let ids: Vec<&str> = result.outputs_by_task.keys().map(String::as_str).collect();
    assert_eq!(ids, vec!["t1", "t2", "t3"]);
    assert_eq!(result.executed.len(), 3);
    assert_eq!(result.metrics.tasks_executed, 3);

    // Exactly three start/end pairs, ended in dependency order.
    assert_eq!(entries_of(&ledger, EntryType::TaskStart).len(), 3);
    assert_eq!(ended_tasks(&ledger), vec!["t1", "t2", "t3"]);

    // One PLAN_SELECTED up front, one GOAL_SUMMARY at the end.
    let selected = entries_of(&ledger, EntryType::PlanSelected);
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].details["planId"], "linear");
    assert_eq!(entries_of(&ledger, EntryType::GoalSummary).len(), 1);
    assert!(!result.goal_summary.is_empty());
}

#[tokio::test]
async fn ledger_digest_chain_validates_and_ids_increase() {
    let registry = echo_registry(&["work"]);
    let ledger = std::sync::Arc::new(straylight::ledger::Ledger::new());

    scheduler_for(linear_plan(), &registry, &ledger)
        .run()
        .await
        .expect("run succeeds");

    ledger.validate().expect("digest chain validates");

    let entries = ledger.entries();
    for pair in entries.windows(2) {
        assert!(pair[1].id > pair[0].id, "ids must strictly increase");
    }
}

#[tokio::test]
async fn task_end_follows_task_start_and_outputs_match_executed() {
    let registry = echo_registry(&["work"]);
    let ledger = std::sync::Arc::new(straylight::ledger::Ledger::new());

    let result = scheduler_for(linear_plan(), &registry, &ledger)
        .run()
        .await
        .expect("run succeeds");

    for task_id in ["t1", "t2", "t3"] {
        let start = position_of(&ledger, EntryType::TaskStart, task_id).expect("start entry");
        let end = position_of(&ledger, EntryType::TaskEnd, task_id).expect("end entry");
        assert!(end > start, "{task_id}: TASK_END must follow TASK_START");

        // outputs[T] set iff T executed iff TASK_END{taskId=T} exists.
        assert!(result.executed.contains(task_id));
        assert!(result.outputs_by_task.contains_key(task_id));
    }
}

#[tokio::test]
async fn downstream_entries_appear_after_upstream_task_end() {
    let registry = echo_registry(&["work"]);
    let ledger = std::sync::Arc::new(straylight::ledger::Ledger::new());

    scheduler_for(linear_plan(), &registry, &ledger)
        .run()
        .await
        .expect("run succeeds");

    let t1_end = position_of(&ledger, EntryType::TaskEnd, "t1").expect("t1 end");
    let t2_start = position_of(&ledger, EntryType::TaskStart, "t2").expect("t2 start");
    assert!(t2_start > t1_end, "dependent task entries follow the dependency's TASK_END");
}

#[tokio::test]
async fn task_outputs_flow_through_shared_map() {
    use serde_json::json;
    use std::sync::Arc;
    use straylight::capability::{Capability, CapabilityRegistry, FnTaskHandler};
    use straylight::plan::{Edge, Plan, TaskSpec};

    // t2 reads t1's output through the run context.
    let registry = Arc::new(CapabilityRegistry::new());
    registry.register(
        Capability::new("produce"),
        Arc::new(FnTaskHandler::from_fn(|_, _| Ok(json!({"value": 21})))),
    );
    registry.register(
        Capability::new("consume"),
        Arc::new(FnTaskHandler::from_fn(|ctx, _| {
            let upstream = ctx
                .output_of("t1")
                .and_then(|v| v.get("value").and_then(serde_json::Value::as_u64))
                .unwrap_or(0);
            Ok(json!({"doubled": upstream.saturating_mul(2)}))
        })),
    );

    let plan = Plan::new("flow")
        .with_task(TaskSpec::new("t1", "produce"))
        .with_task(TaskSpec::new("t2", "consume"))
        .with_edge(Edge::new("t1", "t2"));

    let ledger = Arc::new(straylight::ledger::Ledger::new());
    let result = scheduler_for(plan, &registry, &ledger)
        .run()
        .await
        .expect("run succeeds");

    assert_eq!(result.outputs_by_task["t2"], json!({"doubled": 42}));
}
