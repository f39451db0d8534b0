use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube::Resource;
use kube::runtime::events::{Event, EventType, Recorder};
use tracing::warn;

use crate::controller::error::RetryTracker;
use crate::crd::PgBouncer;
use crate::health::HealthState;

/// Name events are reported under
pub const REPORTER: &str = "pgbouncer-operator";

/// Default name of the shared headless Service.
///
/// The suffix keeps it clear of the `<name>` and `<name>-stats` Services of
/// a PgBouncer called `pgbouncer`.
pub const DEFAULT_GOVERNING_SERVICE: &str = "pgbouncer-governing";

/// Runtime settings for the reconciler
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Shared headless Service used as the StatefulSet `serviceName`
    pub governing_service: String,
    /// How long to wait for pods to pick up a new pgbouncer.ini
    pub config_sync_timeout: Duration,
    /// How long to wait for the StatefulSet to become ready
    pub readiness_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            governing_service: DEFAULT_GOVERNING_SERVICE.to_string(),
            config_sync_timeout: Duration::from_secs(120),
            readiness_timeout: Duration::from_secs(300),
        }
    }
}

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub recorder: Recorder,
    /// Metrics and readiness; absent in tests
    pub health_state: Option<Arc<HealthState>>,
    pub config: ControllerConfig,
    /// Consecutive failures per PgBouncer, feeding the backoff
    pub retries: Arc<RetryTracker>,
}

impl Context {
    pub fn new(
        client: Client,
        health_state: Option<Arc<HealthState>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            recorder: Recorder::new(client.clone(), REPORTER.into()),
            client,
            health_state,
            config,
            retries: Arc::new(RetryTracker::new()),
        }
    }

    /// Publish an event against a PgBouncer. Failures are only logged.
    pub async fn publish_event(
        &self,
        pgbouncer: &PgBouncer,
        type_: EventType,
        reason: &str,
        action: &str,
        note: impl Into<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(note.into()),
            action: action.into(),
            secondary: None,
        };
        if let Err(e) = self
            .recorder
            .publish(&event, &pgbouncer.object_ref(&()))
            .await
        {
            warn!(reason, error = %e, "Failed to publish event");
        }
    }

    pub async fn normal_event(
        &self,
        pgbouncer: &PgBouncer,
        reason: &str,
        action: &str,
        note: impl Into<String>,
    ) {
        self.publish_event(pgbouncer, EventType::Normal, reason, action, note)
            .await;
    }

    pub async fn warning_event(
        &self,
        pgbouncer: &PgBouncer,
        reason: &str,
        action: &str,
        note: impl Into<String>,
    ) {
        self.publish_event(pgbouncer, EventType::Warning, reason, action, note)
            .await;
    }
}
