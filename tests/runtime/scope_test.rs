//! Task-scope filtering and early break.

use crate::common::*;
use straylight::ledger::EntryType;

#[tokio::test]
async fn diamond_scoped_to_t1_executes_only_t1() {
    let registry = echo_registry(&["work"]);
    let ledger = std::sync::Arc::new(straylight::ledger::Ledger::new());

    let result = scheduler_for(diamond_plan(), &registry, &ledger)
        .with_task_scope(vec!["t1".to_owned()])
        .run()
        .await
        .expect("scoped run succeeds");

    assert_eq!(result.outputs_by_task.len(), 1);
    assert!(result.outputs_by_task.contains_key("t1"));
    assert_eq!(result.executed.len(), 1);

    // Early break: t2/t3/t4 never started even though they were pending.
    assert_eq!(entries_of(&ledger, EntryType::TaskStart).len(), 1);
}

#[tokio::test]
async fn scope_without_dependency_executes_nothing() {
    let registry = echo_registry(&["work"]);
    let ledger = std::sync::Arc::new(straylight::ledger::Ledger::new());

    // t2/t3 depend on t1, which is outside the scope: out-of-scope tasks
    // neither execute nor satisfy dependencies.
    let result = scheduler_for(diamond_plan(), &registry, &ledger)
        .with_task_scope(vec!["t2".to_owned(), "t3".to_owned()])
        .run()
        .await
        .expect("run terminates cleanly");

    assert!(result.outputs_by_task.is_empty());
    assert!(result.executed.is_empty());
    assert!(entries_of(&ledger, EntryType::TaskStart).is_empty());
}

#[tokio::test]
async fn empty_scope_executes_nothing_but_still_summarizes() {
    let registry = echo_registry(&["work"]);
    let ledger = std::sync::Arc::new(straylight::ledger::Ledger::new());

    let result = scheduler_for(linear_plan(), &registry, &ledger)
        .with_task_scope(vec![])
        .run()
        .await
        .expect("empty scope run succeeds");

    assert!(result.outputs_by_task.is_empty());
    assert_eq!(entries_of(&ledger, EntryType::PlanSelected).len(), 1);
    assert_eq!(entries_of(&ledger, EntryType::GoalSummary).len(), 1);
}

#[tokio::test]
async fn unscoped_diamond_executes_all_four() {
    let registry = echo_registry(&["work"]);
    let ledger = std::sync::Arc::new(straylight::ledger::Ledger::new());

    let result = scheduler_for(diamond_plan(), &registry, &ledger)
        .run()
        .await
        .expect("run succeeds");

    assert_eq!(result.executed.len(), 4);
    // t4 ends last; t1 ends first.
    let ended = ended_tasks(&ledger);
    assert_eq!(ended.first().map(String::as_str), Some("t1"));
    assert_eq!(ended.last().map(String::as_str), Some("t4"));
}
