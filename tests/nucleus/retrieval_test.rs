//! Preflight, retrieval directives, and the one-round retrieval cap.

use std::sync::Arc;

use serde_json::json;

use crate::common::*;
use straylight::context::ToolContextProvider;
use straylight::ledger::{EntryType, Ledger};
use straylight::nucleus::NucleusConfig;
use straylight::plan::{Plan, TaskSpec};
use straylight::providers::scripted::{ScriptedProvider, ScriptedTurn};
use straylight::runtime::FailureStage;
use straylight::tools::{FnTool, ToolRegistry};

fn preflight_config() -> NucleusConfig {
    NucleusConfig {
        preflight_enabled: true,
        ..NucleusConfig::default()
    }
}

fn kb_provider() -> Arc<ToolContextProvider> {
    Arc::new(ToolContextProvider::new().with_route(
        "kb",
        Arc::new(FnTool::from_fn("kb-fetch", |input| {
            Ok(json!({"body": format!("contents of {}", input["payload"])}))
        })),
    ))
}

#[tokio::test]
async fn preflight_retrieval_then_ready_executes_the_task() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(Ledger::new());

    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![
        ScriptedTurn::text(r#"{"sufficient": false, "directives": ["kb:doc-1"]}"#),
        ScriptedTurn::text(r#"{"sufficient": true}"#),
    ]));

    let plan = Plan::new("needs-context").with_task(TaskSpec::new("t1", "work"));
    let result = scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .with_nucleus_config(preflight_config())
        .with_context_provider(kb_provider())
        .run()
        .await
        .expect("second preflight passes");

    assert!(result.executed.contains("t1"));

    let internalized = entries_of(&ledger, EntryType::ContextInternalized);
    assert_eq!(internalized.len(), 1);
    assert_eq!(internalized[0].details["directive"], "kb:doc-1");
    assert_eq!(internalized[0].details["status"], "fulfilled");
}

#[tokio::test]
async fn still_insufficient_after_one_round_is_fatal() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(Ledger::new());

    // The model keeps demanding context even after doc-1 arrives.
    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![
        ScriptedTurn::text(r#"{"sufficient": false, "directives": ["kb:doc-1"]}"#),
        ScriptedTurn::text(r#"{"sufficient": false, "directives": ["kb:doc-2"]}"#),
    ]));

    let plan = Plan::new("insatiable").with_task(TaskSpec::new("t1", "work"));
    let failure = scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .with_nucleus_config(preflight_config())
        .with_context_provider(kb_provider())
        .run()
        .await
        .expect_err("one retrieval round only");

    assert_eq!(failure.stage, FailureStage::ContextRetrieval);
    assert!(failure.message.contains("kb:doc-2"), "failure names the unresolved directive");

    // Two CONTEXT_INTERNALIZED entries: the fulfilled request, then the
    // unresolved note.
    let internalized = entries_of(&ledger, EntryType::ContextInternalized);
    assert_eq!(internalized.len(), 2);
    assert_eq!(internalized[0].details["status"], "fulfilled");
    assert_eq!(internalized[1].details["status"], "unresolved");
    assert!(entries_of(&ledger, EntryType::TaskEnd).is_empty());
}

#[tokio::test]
async fn needs_context_without_provider_is_fatal() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(Ledger::new());

    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![ScriptedTurn::text(
        r#"{"sufficient": false, "directives": ["kb:doc-1"]}"#,
    )]));

    let plan = Plan::new("stranded").with_task(TaskSpec::new("t1", "work"));
    let failure = scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .with_nucleus_config(preflight_config())
        .run()
        .await
        .expect_err("no provider configured");

    assert_eq!(failure.stage, FailureStage::Preflight);
    assert!(failure.message.contains("kb:doc-1"));
}

#[tokio::test]
async fn unknown_prefix_is_reported_not_panicked() {
    let registry = echo_registry(&["work"]);
    let ledger = Arc::new(Ledger::new());

    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![
        ScriptedTurn::text(r#"{"sufficient": false, "directives": ["jira:TICKET-9"]}"#),
        ScriptedTurn::text(r#"{"sufficient": false, "directives": ["jira:TICKET-9"]}"#),
    ]));

    let plan = Plan::new("unroutable").with_task(TaskSpec::new("t1", "work"));
    let failure = scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .with_nucleus_config(preflight_config())
        .with_context_provider(kb_provider())
        .run()
        .await
        .expect_err("unroutable prefix stays insufficient");

    assert_eq!(failure.stage, FailureStage::ContextRetrieval);
    let internalized = entries_of(&ledger, EntryType::ContextInternalized);
    assert_eq!(internalized[0].details["status"], "failed");
}

#[tokio::test]
async fn invoke_time_retrieval_is_withheld_after_first_fulfillment() {
    let registry = echo_registry(&[]);
    register_probe(&registry, "probe");
    let ledger = Arc::new(Ledger::new());

    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![
        ScriptedTurn::tool_use(
            "c1",
            "request_context_retrieval",
            json!({"directives": ["kb:doc-1"]}),
        ),
        ScriptedTurn::text("answered with retrieved context"),
    ]));
    let scripted = Arc::clone(&provider);

    let plan = Plan::new("mid-run")
        .with_task(TaskSpec::new("t1", "probe").with_input(json!({"prompt": "dig in"})));
    let result = scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .with_context_provider(kb_provider())
        .run()
        .await
        .expect("run succeeds");

    let output = &result.outputs_by_task["t1"];
    assert_eq!(output["retrievalRoundsUsed"], 1);
    assert_eq!(output["text"], "answered with retrieved context");

    let internalized = entries_of(&ledger, EntryType::ContextInternalized);
    assert_eq!(internalized.len(), 1);
    assert_eq!(internalized[0].details["status"], "fulfilled");

    // Round one offered the retrieval tool; round two withheld it.
    let requests = scripted.requests();
    let offered = |index: usize| -> Vec<String> {
        requests[index].tools.iter().map(|t| t.name.clone()).collect()
    };
    assert!(offered(0).contains(&"request_context_retrieval".to_owned()));
    assert!(!offered(1).contains(&"request_context_retrieval".to_owned()));
    assert!(offered(1).contains(&"query_context".to_owned()));
}
