//! Preflight/postcheck hook gating.

use std::sync::Arc;

use serde_json::Value;

use crate::common::*;
use straylight::ledger::{EntryType, Ledger};
use straylight::nucleus::NucleusConfig;
use straylight::plan::{Plan, TaskSpec};
use straylight::providers::scripted::{ScriptedProvider, ScriptedTurn};
use straylight::runtime::FailureStage;
use straylight::tools::ToolRegistry;

fn postcheck_config() -> NucleusConfig {
    NucleusConfig {
        postcheck_enabled: true,
        ..NucleusConfig::default()
    }
}

#[tokio::test]
async fn disabled_hooks_short_circuit() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(Ledger::new());

    // No scripted turns needed for preflight or postcheck: both hooks
    // are off by default.
    let provider = Arc::new(ScriptedProvider::new().with_fallback("summary"));
    let scripted = Arc::clone(&provider);

    let plan = Plan::new("plain").with_task(TaskSpec::new("t1", "work"));
    scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .run()
        .await
        .expect("run succeeds");

    // The only inference round is the goal summary.
    let phases: Vec<Value> = entries_of(&ledger, EntryType::NucleusInference)
        .into_iter()
        .map(|e| e.details["phase"].clone())
        .collect();
    assert_eq!(phases, vec![Value::String("goal_summary".to_owned())]);
    assert_eq!(scripted.requests().len(), 1);
}

#[tokio::test]
async fn postcheck_compensation_verdict_fails_the_task() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(Ledger::new());

    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![ScriptedTurn::text(
        r#"{"verdict": "NEEDS_COMPENSATION", "reason": "wrote to the wrong ledger"}"#,
    )]));

    let plan = Plan::new("judged").with_task(TaskSpec::new("t1", "work"));
    let failure = scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .with_nucleus_config(postcheck_config())
        .run()
        .await
        .expect_err("compensation verdict is fatal");

    assert_eq!(failure.stage, FailureStage::Postcheck);
    assert!(failure.message.contains("wrote to the wrong ledger"));

    let errors = entries_of(&ledger, EntryType::Error);
    assert!(errors.iter().any(|e| e.details["stage"] == "NUCLEUS_POSTCHECK"));
    assert_eq!(entries_of(&ledger, EntryType::Compensation).len(), 1);
    assert!(entries_of(&ledger, EntryType::TaskEnd).is_empty());
}

#[tokio::test]
async fn postcheck_escalation_verdict_fails_the_task() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(Ledger::new());

    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![ScriptedTurn::text(
        r#"{"verdict": "ESCALATE", "reason": "human signoff required"}"#,
    )]));

    let plan = Plan::new("escalated").with_task(TaskSpec::new("t1", "work"));
    let failure = scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .with_nucleus_config(postcheck_config())
        .run()
        .await
        .expect_err("escalation verdict is fatal");

    assert_eq!(failure.stage, FailureStage::Postcheck);
    assert!(failure.message.contains("human signoff required"));
    assert!(entries_of(&ledger, EntryType::Compensation).is_empty());
}

#[tokio::test]
async fn postcheck_complete_verdict_passes() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(Ledger::new());

    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![ScriptedTurn::text(
        r#"{"verdict": "COMPLETE"}"#,
    )]));

    let plan = Plan::new("approved").with_task(TaskSpec::new("t1", "work"));
    let result = scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .with_nucleus_config(postcheck_config())
        .run()
        .await
        .expect("complete verdict passes");
    assert!(result.executed.contains("t1"));
}

#[tokio::test]
async fn unparseable_postcheck_verdict_fails_open() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(Ledger::new());

    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![ScriptedTurn::text(
        "definitely looks good to me!",
    )]));

    let plan = Plan::new("vague").with_task(TaskSpec::new("t1", "work"));
    let result = scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .with_nucleus_config(postcheck_config())
        .run()
        .await
        .expect("advisory hook fails open");
    assert!(result.executed.contains("t1"));
}
