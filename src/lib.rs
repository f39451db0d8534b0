pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod webhooks;

pub use config::{Cli, Command, LogFormat, OperatorConfig};
pub use controller::{
    BackoffConfig, Context, ControllerConfig, Error, FINALIZER, Result, error_policy, reconcile,
};
pub use crd::{AppBinding, PgBouncer, PgBouncerVersion};
pub use health::{HealthState, Metrics};
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::Controller;
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use crate::controller::{app_binding_mapper, secret_mapper};

/// How often the per-phase gauge is refreshed from the controller cache
const PHASE_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Count cached PgBouncers per phase
pub fn count_phases(store: &Store<PgBouncer>) -> BTreeMap<String, i64> {
    let mut counts = BTreeMap::new();
    for pgbouncer in store.state() {
        *counts.entry(pgbouncer.phase().to_string()).or_insert(0) += 1;
    }
    counts
}

/// Gauge values to publish: the current counts, plus zero for phases that emptied out
fn phase_gauge_updates(
    seen: &BTreeMap<String, i64>,
    counts: &BTreeMap<String, i64>,
) -> BTreeMap<String, i64> {
    let mut updates: BTreeMap<String, i64> = seen.keys().map(|phase| (phase.clone(), 0)).collect();
    updates.extend(counts.iter().map(|(phase, count)| (phase.clone(), *count)));
    updates
}

async fn publish_phase_metrics(store: Store<PgBouncer>, health_state: Arc<HealthState>) {
    let mut interval = tokio::time::interval(PHASE_METRICS_INTERVAL);
    let mut seen: BTreeMap<String, i64> = BTreeMap::new();
    loop {
        interval.tick().await;
        let counts = count_phases(&store);
        for (phase, count) in phase_gauge_updates(&seen, &counts) {
            health_state.metrics.set_pgbouncers_by_phase(&phase, count);
        }
        seen = counts;
    }
}

/// Run the PgBouncer controller until `shutdown` resolves.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// When `namespace` is `None`, watches resources cluster-wide.
pub async fn run_controller(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
    config: ControllerConfig,
    workers: u16,
    shutdown: impl Future<Output = ()> + Send + Sync + 'static,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        scope = scope_msg,
        workers,
        "Starting controller for PgBouncer resources"
    );

    let ctx = Arc::new(Context::new(client.clone(), health_state.clone(), config));

    let pgbouncers: Api<PgBouncer> = scoped_api(client.clone(), namespace);
    let statefulsets: Api<StatefulSet> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let configmaps: Api<ConfigMap> = scoped_api(client.clone(), namespace);
    let secrets: Api<Secret> = scoped_api(client.clone(), namespace);
    let pdbs: Api<PodDisruptionBudget> = scoped_api(client.clone(), namespace);
    let app_bindings: Api<AppBinding> = scoped_api(client.clone(), namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    let controller = Controller::new(pgbouncers, watcher_config.clone())
        .with_config(ControllerRuntimeConfig::default().concurrency(workers));
    // The controller's own cache doubles as the index for unowned references
    let store = controller.store();

    let controller = controller
        .owns(statefulsets, watcher_config.clone())
        .owns(services, watcher_config.clone())
        .owns(configmaps, watcher_config.clone())
        .owns(secrets.clone(), watcher_config.clone())
        .owns(pdbs, watcher_config.clone())
        .watches(secrets, watcher_config.clone(), secret_mapper(store.clone()))
        .watches(app_bindings, watcher_config, app_binding_mapper(store.clone()))
        .graceful_shutdown_on(shutdown);

    if let Some(state) = &health_state {
        state.set_ready(true);
    }

    let metrics_task = health_state
        .clone()
        .map(|state| tokio::spawn(publish_phase_metrics(store, state)));

    controller
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // Watch events for an object that was just deleted land here
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    if let Some(task) = metrics_task {
        task.abort();
    }
    if let Some(state) = &health_state {
        state.set_ready(false);
    }
    tracing::info!("Controller stopped");
}
