//! Spec policy: the same checks the controller runs before reconciling

use super::{ValidationContext, ValidationResult};
use crate::controller::validate_spec;

pub fn validate_spec_policy(ctx: &ValidationContext) -> ValidationResult {
    match validate_spec(ctx.pgbouncer, ctx.version) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::denied("InvalidSpec", &e.to_string()),
    }
}
