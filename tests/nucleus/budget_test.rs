//! Token budget enforcement.

use std::sync::Arc;

use serde_json::json;

use crate::common::*;
use straylight::ledger::{EntryType, Ledger};
use straylight::nucleus::NucleusConfig;
use straylight::plan::{Plan, TaskSpec};
use straylight::providers::scripted::{ScriptedProvider, ScriptedTurn};
use straylight::tools::ToolRegistry;

fn tight_budget() -> NucleusConfig {
    NucleusConfig {
        max_context_tokens: 1000,
        ..NucleusConfig::default()
    }
}

#[tokio::test]
async fn crossing_85_percent_forces_a_final_answer() {
    let registry = echo_registry(&[]);
    register_probe(&registry, "probe");
    let ledger = Arc::new(Ledger::new());

    // ~4000 prose characters estimate to ~1000 tokens, past the 850
    // threshold before the first round is sent.
    let long_prompt = "describe the billing reconciliation pipeline ".repeat(90);
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_turns(vec![ScriptedTurn::text("forced final answer")])
            .with_fallback("summary"),
    );

    let plan = Plan::new("budget").with_task(
        TaskSpec::new("t1", "probe").with_input(json!({"prompt": long_prompt})),
    );

    let result = scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .with_nucleus_config(tight_budget())
        .run()
        .await
        .expect("budget exhaustion is not fatal");

    let output = &result.outputs_by_task["t1"];
    assert_eq!(output["budgetExhausted"], true);
    assert_eq!(output["text"], "forced final answer");

    let rounds = output["rounds"].as_u64().expect("rounds");
    assert!(rounds <= 3, "rounds {rounds} must respect max_query_rounds");

    let estimated = output["estimatedPromptTokens"].as_u64().expect("estimate");
    assert!(
        estimated >= 850,
        "budget exhaustion implies >= 85% of max_context_tokens, got {estimated}"
    );

    // Every inference round carries a prompt digest.
    let inferences = entries_of(&ledger, EntryType::NucleusInference);
    assert!(!inferences.is_empty());
    for entry in &inferences {
        let digest = entry.details["promptDigest"].as_str().expect("digest");
        assert_eq!(digest.len(), 64);
    }
}

#[tokio::test]
async fn small_prompts_stay_under_budget() {
    let registry = echo_registry(&[]);
    register_probe(&registry, "probe");
    let ledger = Arc::new(Ledger::new());

    let provider = Arc::new(
        ScriptedProvider::new().with_turns(vec![ScriptedTurn::text("short answer")]),
    );

    let plan = Plan::new("roomy")
        .with_task(TaskSpec::new("t1", "probe").with_input(json!({"prompt": "brief task"})));

    let result = scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .run()
        .await
        .expect("run succeeds");

    let output = &result.outputs_by_task["t1"];
    assert_eq!(output["budgetExhausted"], false);
    assert_eq!(output["rounds"], 1);
    assert_eq!(output["text"], "short answer");
}

#[tokio::test]
async fn round_cap_stops_endless_tool_calling() {
    let registry = echo_registry(&[]);
    register_probe(&registry, "probe");
    let ledger = Arc::new(Ledger::new());

    // The model keeps asking for context and never answers.
    let provider = Arc::new(ScriptedProvider::new().with_turns(vec![
        ScriptedTurn::tool_use("c1", "query_context", json!({"key": "tier"})),
        ScriptedTurn::tool_use("c2", "query_context", json!({"key": "region"})),
        ScriptedTurn::tool_use("c3", "query_context", json!({"key": "tier"})),
        ScriptedTurn::text("never reached"),
    ]));

    let plan = Plan::new("cap")
        .with_task(TaskSpec::new("t1", "probe").with_input(json!({"prompt": "loop forever"})));

    let result = scheduler_custom(plan, &registry, Arc::new(ToolRegistry::new()), provider, &ledger)
        .run()
        .await
        .expect("round cap is not fatal");

    let output = &result.outputs_by_task["t1"];
    assert_eq!(output["rounds"], 3);
    assert_eq!(output["text"], "");
}
