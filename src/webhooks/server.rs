//! Webhook HTTP server handlers
//!
//! Serves the mutating (`/mutate`) and validating (`/validate`) endpoints
//! for PgBouncer resources.

use axum::{Json, Router, extract::State, routing::post};
use k8s_openapi::api::core::v1::Secret;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::{Api, Client, ResourceExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use super::mutation::default_patch;
use super::policies::{ValidationContext, validate_all};
use crate::crd::{PgBouncer, PgBouncerVersion};

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 8443;

/// Status code for failures inside the webhook itself
const INTERNAL_ERROR_CODE: u16 = 500;

/// Shared state for webhook handlers
pub(crate) struct WebhookState {
    pub client: Client,
}

impl WebhookState {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Create the webhook router
pub(crate) fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_pgbouncer))
        .route("/validate", post(validate_pgbouncer))
        .with_state(state)
}

/// Deny with a 500 so the API server reports a webhook failure
pub fn internal_error(request: &AdmissionRequest<DynamicObject>, message: &str) -> AdmissionResponse {
    error!(uid = %request.uid, error = %message, "Webhook internal error");
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = INTERNAL_ERROR_CODE;
    response
}

fn parse(object: &DynamicObject) -> Result<PgBouncer, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(object)?)
}

/// Mutating admission handler
async fn mutate_pgbouncer(
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Invalid AdmissionReview");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(mutate(&request).into_review())
}

/// Attach the defaulting patch on Create and Update
pub fn mutate(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    if !matches!(request.operation, Operation::Create | Operation::Update) {
        return response;
    }
    let Some(object) = &request.object else {
        return internal_error(request, "Missing object in request");
    };

    let pgbouncer = match parse(object) {
        Ok(pgbouncer) => pgbouncer,
        Err(e) => return internal_error(request, &format!("Failed to parse object: {}", e)),
    };
    let patch = match default_patch(&pgbouncer, request.namespace.as_deref()) {
        Ok(patch) => patch,
        Err(e) => return internal_error(request, &format!("Failed to compute patch: {}", e)),
    };

    if patch.0.is_empty() {
        return response;
    }
    info!(uid = %request.uid, name = %pgbouncer.name_any(), operations = patch.0.len(), "Defaulting PgBouncer");
    match response.with_patch(patch) {
        Ok(response) => response,
        Err(e) => internal_error(request, &format!("Failed to serialize patch: {}", e)),
    }
}

/// Validating admission handler
async fn validate_pgbouncer(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Invalid AdmissionReview");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    info!(
        uid = %request.uid,
        operation = ?request.operation,
        namespace = ?request.namespace,
        name = %request.name,
        "Processing admission request"
    );
    Json(validate(&state.client, &request).await.into_review())
}

async fn lookup_version(client: &Client, pgbouncer: &PgBouncer) -> kube::Result<Option<PgBouncerVersion>> {
    let name = pgbouncer.spec.version.trim();
    if name.is_empty() {
        return Ok(None);
    }
    Api::<PgBouncerVersion>::all(client.clone()).get_opt(name).await
}

async fn lookup_user_secret(
    client: &Client,
    pgbouncer: &PgBouncer,
    namespace: Option<&str>,
) -> kube::Result<Option<bool>> {
    let Some(reference) = &pgbouncer.spec.user_list_secret_ref else {
        return Ok(None);
    };
    let namespace = reference
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .or(namespace)
        .unwrap_or("default");
    let secret = Api::<Secret>::namespaced(client.clone(), namespace)
        .get_opt(&reference.name)
        .await?;
    Ok(Some(secret.is_some()))
}

async fn validate(client: &Client, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let is_delete = matches!(request.operation, Operation::Delete);
    // Delete requests only carry the stored object
    let current = if is_delete {
        &request.old_object
    } else {
        &request.object
    };
    let Some(current) = current else {
        if is_delete {
            return AdmissionResponse::from(request);
        }
        return internal_error(request, "Missing object in request");
    };

    let pgbouncer = match parse(current) {
        Ok(pgbouncer) => pgbouncer,
        Err(e) => return internal_error(request, &format!("Failed to parse object: {}", e)),
    };

    let old = match (&request.old_object, &request.operation) {
        (Some(old), Operation::Update) => match parse(old) {
            Ok(old) => Some(old),
            Err(e) => {
                warn!(error = %e, "Failed to parse old PgBouncer, treating as CREATE");
                None
            }
        },
        _ => None,
    };

    let (version, user_secret_exists) = if is_delete {
        (None, None)
    } else {
        let version = match lookup_version(client, &pgbouncer).await {
            Ok(version) => version,
            Err(e) => return internal_error(request, &format!("Failed to look up version: {}", e)),
        };
        let exists =
            match lookup_user_secret(client, &pgbouncer, request.namespace.as_deref()).await {
                Ok(exists) => exists,
                Err(e) => {
                    return internal_error(request, &format!("Failed to look up user secret: {}", e));
                }
            };
        (version, exists)
    };

    let ctx = ValidationContext::new(request.operation.clone(), &pgbouncer)
        .with_old(old.as_ref())
        .with_version(version.as_ref())
        .with_user_secret(user_secret_exists);
    let result = validate_all(&ctx);

    if !result.allowed {
        let message = result
            .message
            .unwrap_or_else(|| "Validation failed".to_string());
        warn!(
            uid = %request.uid,
            reason = ?result.reason,
            message = %message,
            "Admission request denied"
        );
        return AdmissionResponse::from(request).deny(message);
    }

    info!(uid = %request.uid, "Admission request allowed");
    AdmissionResponse::from(request)
}

/// Run the webhook server with TLS
///
/// TLS certificates are loaded from PEM files.
pub async fn run_webhook_server(
    client: Client,
    port: u16,
    cert_path: &str,
    key_path: &str,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;

    let state = Arc::new(WebhookState::new(client));
    let app = create_webhook_router(state);

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Webhook server listening on {} with TLS", addr);

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}

/// Errors that can occur when running the webhook server
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("Webhook server error: {0}")]
    Server(String),
}
