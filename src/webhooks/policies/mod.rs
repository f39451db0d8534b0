//! Admission webhook policies
//!
//! Each policy module exports a `validate` function that checks specific rules.

pub mod immutability;
pub mod spec;
pub mod termination;
pub mod user_secret;

pub use immutability::{IMMUTABLE_PATHS, changed_immutable_paths, validate_immutability};
pub use spec::validate_spec_policy;
pub use termination::validate_deletion;
pub use user_secret::validate_user_secret;

use kube::core::admission::Operation;

use crate::crd::{PgBouncer, PgBouncerVersion};

/// Result of a policy validation
#[derive(Debug, PartialEq, Eq)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

/// Everything a policy may look at.
///
/// Catalog and secret lookups are done by the server beforehand so that
/// policies stay synchronous.
pub struct ValidationContext<'a> {
    pub operation: Operation,
    /// The incoming object, or the stored one on Delete
    pub pgbouncer: &'a PgBouncer,
    pub old_pgbouncer: Option<&'a PgBouncer>,
    /// Catalog entry named by `spec.version`
    pub version: Option<&'a PgBouncerVersion>,
    /// `None` when no user list secret is referenced
    pub user_secret_exists: Option<bool>,
}

impl<'a> ValidationContext<'a> {
    pub fn new(operation: Operation, pgbouncer: &'a PgBouncer) -> Self {
        Self {
            operation,
            pgbouncer,
            old_pgbouncer: None,
            version: None,
            user_secret_exists: None,
        }
    }

    pub fn with_old(mut self, old: Option<&'a PgBouncer>) -> Self {
        self.old_pgbouncer = old;
        self
    }

    pub fn with_version(mut self, version: Option<&'a PgBouncerVersion>) -> Self {
        self.version = version;
        self
    }

    pub fn with_user_secret(mut self, exists: Option<bool>) -> Self {
        self.user_secret_exists = exists;
        self
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.operation, Operation::Delete)
    }
}

/// Run all validation policies and return the first failure
pub fn validate_all(ctx: &ValidationContext) -> ValidationResult {
    let policies: Vec<fn(&ValidationContext) -> ValidationResult> = if ctx.is_delete() {
        vec![validate_deletion]
    } else {
        vec![validate_spec_policy, validate_user_secret, validate_immutability]
    };

    for policy in policies {
        let result = policy(ctx);
        if !result.allowed {
            return result;
        }
    }

    ValidationResult::allowed()
}
