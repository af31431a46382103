//! Edge guard evaluation and branch selection.

use serde_json::Value;

use crate::common::*;
use straylight::ledger::EntryType;
use straylight::plan::{Edge, Plan, TaskSpec};

fn guarded_branch_plan() -> Plan {
    // t1 produces {ok: true}; the happy branch requires it, the sad
    // branch requires the opposite.
    Plan::new("branching")
        .with_task(TaskSpec::new("t1", "work"))
        .with_task(TaskSpec::new("happy", "work"))
        .with_task(TaskSpec::new("sad", "work"))
        .with_edge(Edge::new("t1", "happy").with_guard("outputs.t1.ok == true"))
        .with_edge(Edge::new("t1", "sad").with_guard("outputs.t1.ok == false"))
}

#[tokio::test]
async fn only_the_true_branch_runs() {
    let registry = echo_registry(&["work"]);
    let ledger = std::sync::Arc::new(straylight::ledger::Ledger::new());

    let result = scheduler_for(guarded_branch_plan(), &registry, &ledger)
        .run()
        .await
        .expect("run succeeds");

    assert!(result.executed.contains("happy"));
    assert!(!result.executed.contains("sad"));

    // Every guard evaluation is ledgered with its result.
    let evals = entries_of(&ledger, EntryType::GuardEval);
    assert!(evals
        .iter()
        .any(|e| e.details["edge"] == "t1->happy" && e.details["result"] == true));
    assert!(evals
        .iter()
        .any(|e| e.details["edge"] == "t1->sad" && e.details["result"] == false));

    // The taken branch is recorded and precedes the task's start.
    let branch = entries_of(&ledger, EntryType::BranchTaken);
    assert!(branch.iter().any(|e| e.details["to"] == "happy"));
    let happy_start = position_of(&ledger, EntryType::TaskStart, "happy").expect("start");
    let true_eval = evals
        .iter()
        .find(|e| e.details["edge"] == "t1->happy" && e.details["result"] == true)
        .expect("true eval");
    assert!(true_eval.id < happy_start);
}

#[tokio::test]
async fn guard_over_context_facts() {
    let registry = echo_registry(&["work"]);
    let ledger = std::sync::Arc::new(straylight::ledger::Ledger::new());

    let plan = Plan::new("ctx-guard")
        .with_task(TaskSpec::new("t1", "work"))
        .with_task(TaskSpec::new("t2", "work"))
        .with_edge(Edge::new("t1", "t2").with_guard("context.tier == 'prod'"));

    let result = scheduler_for(plan, &registry, &ledger)
        .run()
        .await
        .expect("run succeeds");
    assert!(result.executed.contains("t2"));
}

#[tokio::test]
async fn malformed_guard_is_false_not_fatal() {
    let registry = echo_registry(&["work"]);
    let ledger = std::sync::Arc::new(straylight::ledger::Ledger::new());

    let plan = Plan::new("bad-guard")
        .with_task(TaskSpec::new("t1", "work"))
        .with_task(TaskSpec::new("t2", "work"))
        .with_edge(Edge::new("t1", "t2").with_guard("this is === not a guard"));

    let result = scheduler_for(plan, &registry, &ledger)
        .run()
        .await
        .expect("run terminates without error");

    // t2 is simply never ready; the run ends after t1.
    assert!(result.executed.contains("t1"));
    assert!(!result.executed.contains("t2"));
    let evals = entries_of(&ledger, EntryType::GuardEval);
    assert!(evals.iter().all(|e| e.details["result"] == Value::Bool(false)
        || e.details["edge"] != "t1->t2"));
}
