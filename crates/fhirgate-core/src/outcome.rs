//! OperationOutcome synthesis.
//!
//! Whenever the pipeline must answer without a backend-sourced body it emits
//! a minimal OperationOutcome: a generated id and a single issue with
//! severity, code and diagnostics.

use serde_json::{Value, json};
use uuid::Uuid;

/// Builds an error OperationOutcome document.
pub fn operation_outcome(code: &str, diagnostics: &str) -> Value {
    json!({
        "resourceType": "OperationOutcome",
        "id": Uuid::new_v4().to_string(),
        "issue": [{
            "severity": "error",
            "code": code,
            "diagnostics": diagnostics,
        }]
    })
}
