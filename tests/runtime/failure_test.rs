//! Retry, policy, verification, and compensation failure paths.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::common::*;
use straylight::checkpoint::MemoryCheckpointStore;
use straylight::ledger::EntryType;
use straylight::plan::{Backoff, Edge, EdgeErrorMode, Plan, RetrySpec, TaskSpec};
use straylight::policy::{RulePolicy, ACTION_TASK_PRE};
use straylight::runtime::FailureStage;

fn fast_retry(attempts: u32) -> RetrySpec {
    RetrySpec {
        attempts,
        backoff: Backoff::Fixed,
        base_ms: 1,
        jitter: false,
    }
}

#[tokio::test]
async fn retry_recovers_within_budget() {
    let registry = echo_registry(&[]);
    let attempts = register_flaky(&registry, "flaky", 2);
    let ledger = Arc::new(straylight::ledger::Ledger::new());

    let plan = Plan::new("retries")
        .with_task(TaskSpec::new("t1", "flaky").with_retry(fast_retry(3)));

    let result = scheduler_for(plan, &registry, &ledger)
        .run()
        .await
        .expect("third attempt succeeds");

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(result.outputs_by_task["t1"]["attempt"], 3);
}

#[tokio::test]
async fn retry_exhaustion_is_fatal_with_checkpoint() {
    let registry = echo_registry(&[]);
    let attempts = register_flaky(&registry, "flaky", 10);
    let ledger = Arc::new(straylight::ledger::Ledger::new());
    let store = Arc::new(MemoryCheckpointStore::new());

    let plan = Plan::new("exhaust")
        .with_task(TaskSpec::new("t1", "flaky").with_retry(fast_retry(2)));

    let failure = scheduler_for(plan, &registry, &ledger)
        .with_checkpoint_store(Arc::clone(&store) as Arc<dyn straylight::checkpoint::CheckpointStore>)
        .run()
        .await
        .expect_err("exhaustion is fatal");

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(failure.stage, FailureStage::Execute);
    assert_eq!(failure.task_id.as_deref(), Some("t1"));
    assert!(failure.checkpoint_id.is_some(), "failure must leave a resume point");

    let errors = entries_of(&ledger, EntryType::Error);
    assert!(errors.iter().any(|e| e.details["stage"] == "execute"));
}

#[tokio::test]
async fn named_retry_policy_uses_run_default() {
    let registry = echo_registry(&[]);
    let attempts = register_flaky(&registry, "flaky", 1);
    let ledger = Arc::new(straylight::ledger::Ledger::new());

    let mut task = TaskSpec::new("t1", "flaky");
    task.retry_policy = Some("standard".to_owned());
    let plan = Plan::new("named-retry").with_task(task);

    scheduler_for(plan, &registry, &ledger)
        .with_default_retry(fast_retry(3))
        .run()
        .await
        .expect("default retry covers one failure");

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn policy_denial_is_fatal_and_ledgered() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(straylight::ledger::Ledger::new());

    let failure = scheduler_for(linear_plan(), &registry, &ledger)
        .with_policy(Arc::new(
            RulePolicy::new().deny(ACTION_TASK_PRE, "t2", "writes are frozen"),
        ))
        .run()
        .await
        .expect_err("denied task is fatal");

    assert_eq!(failure.stage, FailureStage::PolicyPre);
    assert_eq!(failure.task_id.as_deref(), Some("t2"));
    assert!(failure.message.contains("writes are frozen"));

    // t1's decision was allowed and recorded; t2's denial too.
    let pre = entries_of(&ledger, EntryType::PolicyPre);
    assert_eq!(pre.len(), 2);
    assert_eq!(pre[1].details["decision"]["allow"], false);
    // t1 completed before the denial.
    assert_eq!(ended_tasks(&ledger), vec!["t1"]);
}

#[tokio::test]
async fn verification_failure_is_fatal() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(straylight::ledger::Ledger::new());

    let plan = Plan::new("verified").with_task(
        TaskSpec::new("t1", "work")
            .with_verification("outputs.ok == true")
            .with_verification("outputs.missing == true"),
    );

    let failure = scheduler_for(plan, &registry, &ledger)
        .run()
        .await
        .expect_err("second expression fails");

    assert_eq!(failure.stage, FailureStage::Verification);

    let verifications = entries_of(&ledger, EntryType::Verification);
    assert_eq!(verifications.len(), 1);
    assert_eq!(verifications[0].details["result"], false);
    assert_eq!(verifications[0].details["results"][0], true);
    assert_eq!(verifications[0].details["results"][1], false);
    assert!(entries_of(&ledger, EntryType::TaskEnd).is_empty());
}

#[tokio::test]
async fn verification_success_passes_through() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(straylight::ledger::Ledger::new());

    let plan = Plan::new("verified-ok")
        .with_task(TaskSpec::new("t1", "work").with_verification("outputs.ok == true"));

    let result = scheduler_for(plan, &registry, &ledger)
        .run()
        .await
        .expect("verification passes");
    assert!(result.executed.contains("t1"));
}

#[tokio::test]
async fn compensation_required_edge_is_annotated_and_fatal() {
    let registry = echo_registry(&["work"]);
    register_flaky(&registry, "doomed", 10);
    let ledger = Arc::new(straylight::ledger::Ledger::new());

    let plan = Plan::new("compensated")
        .with_task(TaskSpec::new("t1", "work"))
        .with_task(TaskSpec::new("t2", "doomed").with_retry(fast_retry(1)))
        .with_edge(Edge::new("t1", "t2").with_on_error(EdgeErrorMode::CompensationRequired));

    let failure = scheduler_for(plan, &registry, &ledger)
        .run()
        .await
        .expect_err("still fatal in this version");

    assert_eq!(failure.stage, FailureStage::Execute);
    let compensations = entries_of(&ledger, EntryType::Compensation);
    assert_eq!(compensations.len(), 1);
    assert_eq!(compensations[0].details["edge"], "t1->t2");
    assert_eq!(compensations[0].details["taskId"], "t2");
}

#[tokio::test]
async fn unknown_capability_fails_before_execution() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(straylight::ledger::Ledger::new());

    let plan = Plan::new("ghost").with_task(TaskSpec::new("t1", "not-registered"));

    let failure = scheduler_for(plan, &registry, &ledger)
        .run()
        .await
        .expect_err("unknown capability is a configuration error");

    assert_eq!(failure.stage, FailureStage::Configuration);
    assert!(entries_of(&ledger, EntryType::TaskStart).is_empty());
}

#[tokio::test]
async fn capability_map_version_mismatch_rejected() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(straylight::ledger::Ledger::new());

    let scheduler = scheduler_for(linear_plan(), &registry, &ledger);
    // Bump the registry after the plan was stamped.
    registry.set_version("v2");

    let failure = scheduler.run().await.expect_err("version drift rejected");
    assert_eq!(failure.stage, FailureStage::Configuration);
    assert!(failure.message.contains("capability map"));
}

#[tokio::test]
async fn cancellation_stops_before_work() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(straylight::ledger::Ledger::new());
    let (tx, rx) = tokio::sync::watch::channel(true);

    let failure = scheduler_for(linear_plan(), &registry, &ledger)
        .with_cancellation(rx)
        .run()
        .await
        .expect_err("cancelled immediately");

    assert_eq!(failure.stage, FailureStage::Cancelled);
    assert!(entries_of(&ledger, EntryType::TaskStart).is_empty());
    drop(tx);
}
