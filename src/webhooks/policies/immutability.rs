//! Immutability policy
//!
//! Identity fields and the pod node selector cannot change after creation.

use serde_json::Value;

use super::{ValidationContext, ValidationResult};
use crate::crd::PgBouncer;

/// JSON pointers that must not change on Update
pub const IMMUTABLE_PATHS: [&str; 5] = [
    "/apiVersion",
    "/kind",
    "/metadata/name",
    "/metadata/namespace",
    "/spec/podTemplate/spec/nodeSelector",
];

/// Immutable paths whose values differ between `old` and `new`
pub fn changed_immutable_paths(old: &Value, new: &Value) -> Vec<String> {
    IMMUTABLE_PATHS
        .iter()
        .filter(|path| old.pointer(path) != new.pointer(path))
        .map(|path| path.trim_start_matches('/').replace('/', "."))
        .collect()
}

fn to_value(pgbouncer: &PgBouncer) -> Value {
    serde_json::to_value(pgbouncer).unwrap_or(Value::Null)
}

/// Reject updates that touch an immutable path, listing every one touched
pub fn validate_immutability(ctx: &ValidationContext) -> ValidationResult {
    // Only apply immutability checks on UPDATE, not CREATE
    let Some(old) = ctx.old_pgbouncer else {
        return ValidationResult::allowed();
    };

    let violations = changed_immutable_paths(&to_value(old), &to_value(ctx.pgbouncer));
    if violations.is_empty() {
        return ValidationResult::allowed();
    }

    ValidationResult::denied(
        "ImmutableFieldChanged",
        &format!(
            "The following fields cannot be changed: {}",
            violations.join(", ")
        ),
    )
}
