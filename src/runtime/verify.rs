//! Output verification seam.
//!
//! After a task produces output (and policy has passed), the runtime
//! evaluates the task's verification expressions through the configured
//! [`Verifier`]. Any false expression fails the task fatally.

use serde_json::{json, Value};

use crate::guard::{self, GuardBindings};

/// Judges a task output against verification expressions.
pub trait Verifier: Send + Sync {
    /// Evaluate one expression against the output. Must be deterministic.
    fn verify(&self, task_id: &str, output: &Value, expression: &str) -> bool;
}

/// The default verifier: guard-language expressions with the task output
/// bound under `outputs.output` and, when the output is an object, its
/// fields spliced directly under `outputs`.
///
/// `outputs.total > 0` reads a field of an object output;
/// `outputs.output == 42` reads a scalar output whole.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardVerifier;

impl Verifier for GuardVerifier {
    fn verify(&self, _task_id: &str, output: &Value, expression: &str) -> bool {
        let mut outputs = match output {
            Value::Object(map) => Value::Object(map.clone()),
            _ => json!({}),
        };
        if let Value::Object(map) = &mut outputs {
            map.insert("output".to_owned(), output.clone());
        }
        let bindings = GuardBindings {
            outputs,
            ..GuardBindings::default()
        };
        guard::evaluate_or_false(expression, &bindings)
    }
}
