//! Nucleus prompt assembly.
//!
//! Every prompt the nucleus sends carries three fixed sections: grounding
//! rules (which context keys exist), validation rules (cite those keys),
//! and the grounding constraint (no fabrication). These are prompt
//! conventions only; the runtime enforces shape, not content.

use serde_json::Value;

use crate::plan::TaskSpec;
use crate::types::Goal;

/// Citation and no-fabrication rules injected into every system prompt.
const VALIDATION_RULES: &str = "\
VALIDATION RULES:
1. Cite the context key for every fact you rely on, as [key].
2. If a needed fact has no key, say so instead of guessing.
3. Keep answers to the task objective; do not volunteer side work.";

/// The hard constraint closing every system prompt.
const GROUNDING_CONSTRAINT: &str = "\
GROUNDING CONSTRAINT: never fabricate context values, tool outputs, or \
identifiers. Anything not present under the keys listed above or returned \
by a tool in this conversation does not exist.";

/// Assemble the fixed system prompt from the visible context keys.
pub fn system_prompt(context_keys: &[String]) -> String {
    let keys = if context_keys.is_empty() {
        "(none)".to_owned()
    } else {
        context_keys.join(", ")
    };
    format!(
        "GROUNDING RULES:\nAvailable context keys: {keys}.\nRead them with \
         the query_context tool before relying on them.\n\n{VALIDATION_RULES}\n\n{GROUNDING_CONSTRAINT}"
    )
}

/// The opening user prompt for an LLM-mediated task.
pub fn task_prompt(task: &TaskSpec, input: &Value) -> String {
    let title = task.title.as_deref().unwrap_or(&task.id);
    let objective = task
        .objective
        .as_deref()
        .unwrap_or("complete the task as specified by its input");
    let mut prompt = format!("Task: {title}\nObjective: {objective}\n");
    if let Some(criteria) = &task.success_criteria {
        prompt.push_str(&format!("Success criteria: {criteria}\n"));
    }
    if !input.is_null() {
        let rendered = serde_json::to_string_pretty(input).unwrap_or_else(|_| "{}".to_owned());
        prompt.push_str(&format!("Input:\n{rendered}\n"));
    }
    prompt.push_str("Produce the task output. Use tools as needed, then give a final answer.");
    prompt
}

/// Preflight round: is the visible context sufficient for this task?
///
/// The model must answer with JSON only:
/// `{"sufficient": bool, "directives": ["prefix:payload", ...]}`.
pub fn preflight_prompt(task: &TaskSpec, fact_keys: &[String], scope_keys: &[String]) -> String {
    let objective = task
        .objective
        .as_deref()
        .unwrap_or("complete the task as specified by its input");
    format!(
        "You are checking whether the available context suffices to start a task.\n\
         Task: {id}\nObjective: {objective}\n\
         Context packet keys: {facts}\nInternal scope keys: {scope}\n\n\
         Answer with JSON only, no prose:\n\
         {{\"sufficient\": true}} if the context is enough, or\n\
         {{\"sufficient\": false, \"directives\": [\"prefix:payload\", ...]}} \
         listing the retrievals needed.",
        id = task.id,
        facts = join_or_none(fact_keys),
        scope = join_or_none(scope_keys),
    )
}

/// Postcheck round: judge a task output against its success criteria.
///
/// The model must answer with JSON only:
/// `{"verdict": "COMPLETE" | "NEEDS_COMPENSATION" | "ESCALATE", "reason": "..."}`.
pub fn postcheck_prompt(task: &TaskSpec, output: &Value) -> String {
    let criteria = task
        .success_criteria
        .as_deref()
        .unwrap_or("the output fulfills the task objective");
    let rendered = serde_json::to_string_pretty(output).unwrap_or_else(|_| "null".to_owned());
    format!(
        "You are judging a completed task.\nTask: {id}\nSuccess criteria: {criteria}\n\
         Output:\n{rendered}\n\n\
         Answer with JSON only, no prose:\n\
         {{\"verdict\": \"COMPLETE\"}} when the criteria are met,\n\
         {{\"verdict\": \"NEEDS_COMPENSATION\", \"reason\": \"...\"}} when completed \
         work must be undone,\n\
         {{\"verdict\": \"ESCALATE\", \"reason\": \"...\"}} when a human must decide.",
        id = task.id,
    )
}

/// End-of-run summary over the plan and per-task outcomes.
pub fn goal_summary_prompt(goal: &Goal, plan_id: &str, outcomes: &[(String, bool)]) -> String {
    let mut lines = String::new();
    for (task_id, succeeded) in outcomes {
        let status = if *succeeded { "completed" } else { "not executed" };
        lines.push_str(&format!("- {task_id}: {status}\n"));
    }
    if lines.is_empty() {
        lines.push_str("(no tasks executed)\n");
    }
    format!(
        "Summarize the outcome of this run in a short paragraph.\n\
         Goal: {intent}\nPlan: {plan_id}\nTasks:\n{lines}\
         State plainly what was accomplished and what was not.",
        intent = goal.intent,
    )
}

fn join_or_none(keys: &[String]) -> String {
    if keys.is_empty() {
        "(none)".to_owned()
    } else {
        keys.join(", ")
    }
}
