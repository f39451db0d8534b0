//! Deletion guard for `terminationPolicy: DoNotTerminate`

use super::{ValidationContext, ValidationResult};
use crate::crd::TerminationPolicy;

pub fn validate_deletion(ctx: &ValidationContext) -> ValidationResult {
    if ctx.pgbouncer.termination_policy() == TerminationPolicy::DoNotTerminate {
        return ValidationResult::denied(
            "DeletionBlocked",
            &format!(
                "PgBouncer {} has terminationPolicy DoNotTerminate. Change the policy before deleting it.",
                kube::ResourceExt::name_any(ctx.pgbouncer)
            ),
        );
    }
    ValidationResult::allowed()
}
