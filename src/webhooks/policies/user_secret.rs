//! A referenced user list secret must exist unless pgbouncer accepts any user

use super::{ValidationContext, ValidationResult};

pub fn validate_user_secret(ctx: &ValidationContext) -> ValidationResult {
    let Some(reference) = &ctx.pgbouncer.spec.user_list_secret_ref else {
        return ValidationResult::allowed();
    };
    if !ctx.pgbouncer.uses_auth_file() || ctx.user_secret_exists != Some(false) {
        return ValidationResult::allowed();
    }

    ValidationResult::denied(
        "UserSecretNotFound",
        &format!("user list secret {} not found", reference.name),
    )
}
