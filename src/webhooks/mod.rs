//! Admission webhooks for PgBouncer resources
//!
//! The mutating endpoint fills in defaults. The validating endpoint runs the
//! policies in [`policies`]:
//! - spec checks shared with the controller
//! - the user list secret must exist when an auth file is used
//! - identity fields and the node selector are immutable
//! - `DoNotTerminate` blocks deletion

pub mod mutation;
pub mod policies;
mod server;

pub use mutation::default_patch;
pub use policies::{ValidationContext, ValidationResult, validate_all};
pub use server::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, internal_error, mutate,
    run_webhook_server,
};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
