//! Error types for the PgBouncer controller

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

use crate::resources::exec::ExecError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Naming collision: {0}")]
    NameCollision(String),

    #[error("Pod exec failed: {0}")]
    ExecError(#[from] ExecError),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),

    #[error("Permanent error (will not retry): {0}")]
    PermanentError(String),
}

impl Error {
    /// Check if this error indicates a resource was not found
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(e) => matches!(e, kube::Error::Api(api_err) if api_err.code == 404),
            _ => false,
        }
    }

    /// Errors caused by the user's spec rather than the cluster.
    ///
    /// These are reported as events and are not retried until the object changes.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Error::ValidationError(_) | Error::NameCollision(_))
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::TransientError(_) => true,
            Error::PermanentError(_) => false,
            Error::InvalidConfig(_) => false,
            Error::ValidationError(_) => false,
            Error::NameCollision(_) => false,
            Error::ExecError(_) => true,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
            Error::NotFound(_) => true, // Resource might appear later
            Error::FinalizerError(_) => true,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Non-retryable errors wait for manual intervention
            self.max_delay
        }
    }
}

/// Context for tracking error state during reconciliation
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    /// Number of consecutive errors
    pub consecutive_errors: u32,
    /// Last error message
    pub last_error: Option<String>,
}

impl ErrorContext {
    /// Record an error
    pub fn record_error(&mut self, error: &Error) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_error = Some(error.to_string());
    }

    /// Reset error tracking (called on successful reconciliation)
    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
        self.last_error = None;
    }

    /// Check if we've exceeded max retries
    pub fn exceeded_max_retries(&self, max_retries: u32) -> bool {
        self.consecutive_errors >= max_retries
    }
}

/// Per-object error history, keyed by `namespace/name`.
///
/// Owned by the controller context so each controller instance keeps its own.
#[derive(Debug, Default)]
pub struct RetryTracker {
    entries: Mutex<HashMap<String, ErrorContext>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the number of failures before this one
    pub fn record_failure(&self, key: &str, error: &Error) -> u32 {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = entries.entry(key.to_string()).or_default();
        let previous = entry.consecutive_errors;
        entry.record_error(error);
        previous
    }

    /// Forget the history of an object after a successful reconcile
    pub fn reset(&self, key: &str) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(key).map(|e| e.consecutive_errors).unwrap_or(0)
    }
}
