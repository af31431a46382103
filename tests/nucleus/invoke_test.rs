//! The invoke loop: context queries, task tools, malformed calls.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::common::*;
use straylight::ledger::{EntryType, Ledger};
use straylight::plan::{Plan, TaskSpec};
use straylight::providers::scripted::{ScriptedProvider, ScriptedTurn};
use straylight::runtime::FailureStage;
use straylight::tools::{FnTool, ToolRegistry};

fn probe_plan(tools: &[&str]) -> Plan {
    let mut task = TaskSpec::new("t1", "probe").with_input(json!({"prompt": "answer the question"}));
    for tool in tools {
        task = task.with_tool(*tool);
    }
    Plan::new("invoke").with_task(task)
}

#[tokio::test]
async fn query_context_reads_packet_facts() {
    let registry = echo_registry(&[]);
    register_probe(&registry, "probe");
    let ledger = Arc::new(Ledger::new());

    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![
        ScriptedTurn::tool_use("c1", "query_context", json!({"key": "region"})),
        ScriptedTurn::text("the region is eu-west-1 [region]"),
    ]));
    let scripted = Arc::clone(&provider);

    let result = scheduler_custom(
        probe_plan(&[]),
        &registry,
        Arc::new(ToolRegistry::new()),
        provider,
        &ledger,
    )
    .run()
    .await
    .expect("run succeeds");

    assert_eq!(
        result.outputs_by_task["t1"]["text"],
        "the region is eu-west-1 [region]"
    );
    assert_eq!(result.outputs_by_task["t1"]["rounds"], 2);

    // The second round's conversation carried the tool result back.
    let requests = scripted.requests();
    let followup = requests
        .iter()
        .skip(1)
        .find(|r| r.messages.len() > 1)
        .expect("tool-result round");
    let rendered: String = followup.messages.iter().map(|m| format!("{m:?}")).collect();
    assert!(rendered.contains("eu-west-1"));
}

#[tokio::test]
async fn task_tools_are_offered_and_ledgered() {
    let registry = echo_registry(&[]);
    register_probe(&registry, "probe");
    let ledger = Arc::new(Ledger::new());

    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(
        FnTool::from_fn("lookup", |input| Ok(json!({"hit": input["q"]})))
            .with_description("lookup things"),
    ));

    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![
        ScriptedTurn::tool_use("c1", "lookup", json!({"q": "stale flags"})),
        ScriptedTurn::text("found it"),
    ]));
    let scripted = Arc::clone(&provider);

    let result = scheduler_custom(probe_plan(&["lookup"]), &registry, tools, provider, &ledger)
        .run()
        .await
        .expect("run succeeds");
    assert_eq!(result.outputs_by_task["t1"]["text"], "found it");

    // The model was offered the task tool alongside the context tools.
    let first_tools: Vec<String> = scripted.requests()[0]
        .tools
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert!(first_tools.contains(&"query_context".to_owned()));
    assert!(first_tools.contains(&"lookup".to_owned()));

    // The call went through the envelope wrapper: paired start/complete
    // sharing one envelope id, attributed to the task.
    let calls = entries_of(&ledger, EntryType::ToolCall);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].details["stage"], "start");
    assert_eq!(calls[1].details["stage"], "complete");
    assert_eq!(calls[0].details["taskId"], "t1");
    assert_eq!(
        calls[0].details["envelope"]["id"],
        calls[1].details["envelope"]["id"]
    );
    assert_eq!(result.metrics.tool_calls, 1);
}

#[tokio::test]
async fn every_envelope_start_has_exactly_one_terminal_stage() {
    let registry = echo_registry(&[]);
    register_probe(&registry, "probe");
    let ledger = Arc::new(Ledger::new());

    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(FnTool::from_fn("ok-tool", |_| Ok(json!(1)))));
    tools.register(Arc::new(FnTool::from_fn("bad-tool", |_| {
        Err(straylight::tools::ToolError::ExecutionFailed("down".to_owned()))
    })));

    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![
        ScriptedTurn::tool_use("c1", "ok-tool", json!({})),
        ScriptedTurn::tool_use("c2", "bad-tool", json!({})),
        ScriptedTurn::text("wrapped up"),
    ]));

    scheduler_custom(
        probe_plan(&["ok-tool", "bad-tool"]),
        &registry,
        tools,
        provider,
        &ledger,
    )
    .run()
    .await
    .expect("tool errors inside invoke are recoverable");

    let mut stages: HashMap<String, Vec<String>> = HashMap::new();
    for entry in entries_of(&ledger, EntryType::ToolCall) {
        let id = entry.details["envelope"]["id"].as_str().expect("id").to_owned();
        let stage = entry.details["stage"].as_str().expect("stage").to_owned();
        stages.entry(id).or_default().push(stage);
    }
    assert_eq!(stages.len(), 2);
    for (id, seq) in stages {
        assert_eq!(seq[0], "start", "{id} must open with start");
        assert_eq!(seq.len(), 2, "{id} must close exactly once");
        assert!(seq[1] == "complete" || seq[1] == "error");
    }
}

#[tokio::test]
async fn tools_outside_the_allowance_are_refused() {
    let registry = echo_registry(&[]);
    register_probe(&registry, "probe");
    let ledger = Arc::new(Ledger::new());

    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(FnTool::from_fn("lookup", |_| Ok(json!(1)))));

    // The task never declared `lookup`, so the call is refused without
    // ever reaching the registry.
    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![
        ScriptedTurn::tool_use("c1", "lookup", json!({})),
        ScriptedTurn::text("gave up"),
    ]));

    let result = scheduler_custom(probe_plan(&[]), &registry, tools, provider, &ledger)
        .run()
        .await
        .expect("refusal is recoverable");

    assert_eq!(result.outputs_by_task["t1"]["text"], "gave up");
    assert!(entries_of(&ledger, EntryType::ToolCall).is_empty());
}

#[tokio::test]
async fn register_llm_capability_answers_through_the_nucleus() {
    use straylight::capability::Capability;
    use straylight::ledger::EntryType as Entry;

    // No hand-written handler: the capability's body is the stock
    // LLM-mediated one.
    let registry = echo_registry(&[]);
    registry.register_llm(Capability::new("summarize"));
    let ledger = Arc::new(Ledger::new());

    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(
        FnTool::from_fn("lookup", |input| Ok(json!({"hit": input["q"]})))
            .with_description("lookup things"),
    ));

    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![
        ScriptedTurn::tool_use("c1", "lookup", json!({"q": "deploy region"})),
        ScriptedTurn::text("the deploy region is eu-west-1 [region]"),
    ]));
    let scripted = Arc::clone(&provider);

    let plan = Plan::new("stock-llm").with_task(
        TaskSpec::new("t1", "summarize")
            .with_objective("name the deployment region")
            .with_input(json!({"service": "billing"}))
            .with_tool("lookup"),
    );

    let result = scheduler_custom(plan, &registry, tools, provider, &ledger)
        .run()
        .await
        .expect("run succeeds");

    let output = &result.outputs_by_task["t1"];
    assert_eq!(output["answer"], "the deploy region is eu-west-1 [region]");
    assert_eq!(output["rounds"], 2);
    assert_eq!(output["budgetExhausted"], false);

    // The opening prompt carried the task objective and input.
    let opening = scripted.requests()[0].messages[0].text();
    assert!(opening.contains("name the deployment region"));
    assert!(opening.contains("billing"));

    // The declared tool went through the envelope wrapper, and the
    // inference rounds were ledgered.
    assert_eq!(entries_of(&ledger, Entry::ToolCall).len(), 2);
    assert!(!entries_of(&ledger, Entry::NucleusInference).is_empty());
}

#[tokio::test]
async fn persistent_malformed_tool_calls_fail_the_task() {
    let registry = echo_registry(&[]);
    register_probe(&registry, "probe");
    let ledger = Arc::new(Ledger::new());

    // Three rounds of query_context with no key: one past the retry
    // budget of two.
    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![
        ScriptedTurn::tool_use("c1", "query_context", json!({})),
        ScriptedTurn::tool_use("c2", "query_context", json!({})),
        ScriptedTurn::tool_use("c3", "query_context", json!({})),
    ]));

    let failure = scheduler_custom(
        probe_plan(&[]),
        &registry,
        Arc::new(ToolRegistry::new()),
        provider,
        &ledger,
    )
    .run()
    .await
    .expect_err("malformed calls exhaust their retry budget");

    assert_eq!(failure.stage, FailureStage::Execute);
    assert!(failure.message.contains("malformed tool call"));

    let malformed: Vec<Value> = entries_of(&ledger, EntryType::Error)
        .into_iter()
        .map(|e| e.details)
        .filter(|d| d["stage"] == "nucleus_tool_call")
        .collect();
    assert_eq!(malformed.len(), 3);
}
