//! Operator health endpoints and PgBouncer metrics
//!
//! The health server answers kubelet health checks and Prometheus scrapes:
//! - `/healthz` answers as long as the process runs
//! - `/readyz` answers 200 once the controller is watching
//! - `/metrics` serves the registry below in the text exposition format

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{Router, extract::State, http::StatusCode, http::header, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::resources::live_sync::LiveSyncReport;

/// Default health server port
pub const HEALTH_PORT: u16 = 8080;

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// One PgBouncer object
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InstanceLabels {
    pub namespace: String,
    pub name: String,
}

impl InstanceLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// How a reconcile pass ended
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ReconcileOutcome {
    Success,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    namespace: String,
    name: String,
    outcome: ReconcileOutcome,
}

/// What happened to one pod during a live config sync
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum PodSyncOutcome {
    Reloaded,
    TimedOut,
    ReloadFailed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PodSyncLabels {
    namespace: String,
    name: String,
    outcome: PodSyncOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RejectionLabels {
    namespace: String,
    name: String,
    reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PhaseLabels {
    phase: String,
}

/// Registry plus handles to every metric the controller writes
pub struct Metrics {
    reconciles: Family<ReconcileLabels, Counter>,
    reconcile_duration: Family<InstanceLabels, Histogram>,
    pod_config_syncs: Family<PodSyncLabels, Counter>,
    spec_rejections: Family<RejectionLabels, Counter>,
    pgbouncers: Family<PhaseLabels, Gauge>,
    replicas_desired: Family<InstanceLabels, Gauge>,
    replicas_ready: Family<InstanceLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("pgbouncer_operator");

        let reconciles = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "reconciles",
            "Reconcile passes by outcome",
            reconciles.clone(),
        );

        // A pass can wait minutes for the StatefulSet to become ready
        let reconcile_duration = Family::<InstanceLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.01, 2.0, 16))
        });
        registry.register(
            "reconcile_duration_seconds",
            "Wall time of successful reconcile passes",
            reconcile_duration.clone(),
        );

        let pod_config_syncs = Family::<PodSyncLabels, Counter>::default();
        registry.register(
            "pod_config_syncs",
            "Pods handled by a live pgbouncer.ini sync, by outcome",
            pod_config_syncs.clone(),
        );

        let spec_rejections = Family::<RejectionLabels, Counter>::default();
        registry.register(
            "spec_rejections",
            "Times a PgBouncer was moved to Failed, by reason",
            spec_rejections.clone(),
        );

        let pgbouncers = Family::<PhaseLabels, Gauge>::default();
        registry.register("pgbouncers", "PgBouncer objects by phase", pgbouncers.clone());

        let replicas_desired = Family::<InstanceLabels, Gauge>::default();
        registry.register(
            "replicas_desired",
            "spec.replicas of each PgBouncer",
            replicas_desired.clone(),
        );

        let replicas_ready = Family::<InstanceLabels, Gauge>::default();
        registry.register(
            "replicas_ready",
            "Ready pgbouncer pods of each PgBouncer",
            replicas_ready.clone(),
        );

        Self {
            reconciles,
            reconcile_duration,
            pod_config_syncs,
            spec_rejections,
            pgbouncers,
            replicas_desired,
            replicas_ready,
            registry,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        self.count_reconcile(namespace, name, ReconcileOutcome::Success);
        self.reconcile_duration
            .get_or_create(&InstanceLabels::new(namespace, name))
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.count_reconcile(namespace, name, ReconcileOutcome::Error);
    }

    fn count_reconcile(&self, namespace: &str, name: &str, outcome: ReconcileOutcome) {
        self.reconciles
            .get_or_create(&ReconcileLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
                outcome,
            })
            .inc();
    }

    /// Count every pod of a live sync under its outcome
    pub fn record_live_sync(&self, namespace: &str, name: &str, report: &LiveSyncReport) {
        for (outcome, pods) in [
            (PodSyncOutcome::Reloaded, &report.reloaded),
            (PodSyncOutcome::TimedOut, &report.timed_out),
            (PodSyncOutcome::ReloadFailed, &report.reload_failed),
        ] {
            if pods.is_empty() {
                continue;
            }
            self.pod_config_syncs
                .get_or_create(&PodSyncLabels {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    outcome,
                })
                .inc_by(pods.len() as u64);
        }
    }

    pub fn record_rejection(&self, namespace: &str, name: &str, reason: &str) {
        self.spec_rejections
            .get_or_create(&RejectionLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn set_pgbouncers_by_phase(&self, phase: &str, count: i64) {
        self.pgbouncers
            .get_or_create(&PhaseLabels {
                phase: phase.to_string(),
            })
            .set(count);
    }

    pub fn set_replicas(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = InstanceLabels::new(namespace, name);
        self.replicas_desired.get_or_create(&labels).set(desired);
        self.replicas_ready.get_or_create(&labels).set(ready);
    }

    /// Text exposition of the registry; empty if encoding fails
    pub(crate) fn encode(&self) -> String {
        let mut buffer = String::new();
        match encode(&mut buffer, &self.registry) {
            Ok(()) => buffer,
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }
}

/// State shared by the controller and the health server
#[derive(Default)]
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Metrics,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip readiness; set while the controller is watching
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

async fn readyz(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_TEXT)],
        state.metrics.encode(),
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the health endpoints on every interface until the task is dropped
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Health server listening");
    axum::serve(listener, create_router(state)).await
}
