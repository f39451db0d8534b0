use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default port pgbouncer listens on
pub const DEFAULT_LISTEN_PORT: i32 = 5432;

/// Default listen address
pub const DEFAULT_LISTEN_ADDRESS: &str = "*";

/// Default port the stats service exposes exporter metrics on
pub const DEFAULT_EXPORTER_SERVICE_PORT: i32 = 56790;

/// PgBouncer is the Schema for the pgbouncers API
///
/// `v1alpha2` is the only served and stored version. The serde aliases on
/// renamed fields let this crate parse `v1alpha1` manifests it reads itself
/// (files and fixtures) and write them back in canonical form. They do not
/// reach objects in the cluster: the API server prunes fields the structural
/// schema does not list, so a `v1alpha1` manifest has to be converted before
/// it is applied.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "pgbouncer-operator.smoketurner.com",
    version = "v1alpha2",
    kind = "PgBouncer",
    plural = "pgbouncers",
    shortname = "pb",
    namespaced,
    status = "PgBouncerStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgBouncerSpec {
    /// Number of pgbouncer pods. Defaulted to 1 by the mutating webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Name of a PgBouncerVersion catalog entry
    #[serde(default)]
    pub version: String,

    /// Pool tuning rendered into the [pgbouncer] section
    #[serde(
        default,
        alias = "connectionPoolConfig",
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_pool: Option<ConnectionPoolSpec>,

    /// Upstream databases rendered into the [databases] section
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<DatabaseSpec>,

    /// Secret with `"user" "password"` lines merged into the auth file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_list_secret_ref: Option<SecretReference>,

    /// What happens to owned objects when the PgBouncer is deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_policy: Option<TerminationPolicy>,

    /// Exporter sidecar and scrape configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorSpec>,

    /// Pod level overrides for the StatefulSet template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplate>,

    /// Overrides for the primary Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_template: Option<ServiceTemplate>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPoolSpec {
    /// Port pgbouncer listens on
    #[serde(default, alias = "listenPort", skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Address pgbouncer binds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_mode: Option<PoolMode>,

    /// Users allowed on the admin console in addition to `pgbouncer`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admin_users: Vec<String>,

    /// pgbouncer `auth_type` (md5, scram-sha-256, trust, any, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_user: Option<String>,

    /// Extra startup parameters to ignore. `extra_float_digits` is always ignored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_startup_parameters: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_client_connections: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_db_connections: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_user_connections: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_pool_size: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pool_size: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_pool_size: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_pool_timeout_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_period_seconds: Option<i64>,
}

/// pgbouncer server connection reuse mode
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    #[default]
    Session,
    Transaction,
    Statement,
}

impl std::fmt::Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolMode::Session => write!(f, "session"),
            PoolMode::Transaction => write!(f, "transaction"),
            PoolMode::Statement => write!(f, "statement"),
        }
    }
}

/// One entry of the [databases] section
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Name clients connect to. Must be unique within a PgBouncer.
    pub alias: String,

    /// Database name on the upstream server
    #[serde(alias = "dbName")]
    pub database_name: String,

    /// AppBinding that resolves to the upstream host and port
    #[serde(alias = "databaseRef")]
    pub app_binding_ref: AppBindingReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppBindingReference {
    pub name: String,

    /// Defaults to the PgBouncer's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,

    /// Defaults to the PgBouncer's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Deletion behaviour for owned objects
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Deletion is rejected by the validating webhook
    DoNotTerminate,
    /// Keep the auth secret and the ConfigMap
    Pause,
    /// Keep the auth secret
    #[default]
    Delete,
    /// Remove everything
    WipeOut,
}

impl std::fmt::Display for TerminationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationPolicy::DoNotTerminate => write!(f, "DoNotTerminate"),
            TerminationPolicy::Pause => write!(f, "Pause"),
            TerminationPolicy::Delete => write!(f, "Delete"),
            TerminationPolicy::WipeOut => write!(f, "WipeOut"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSpec {
    /// Monitoring agent. Unset disables the exporter sidecar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<MonitorAgent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusSpec>,

    /// Resources for the exporter sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum MonitorAgent {
    /// Scrape annotations on the stats Service
    #[serde(rename = "prometheus.io/builtin")]
    PrometheusBuiltin,
    /// A ServiceMonitor for the Prometheus operator
    #[serde(rename = "prometheus.io/operator")]
    PrometheusOperator,
}

impl MonitorAgent {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorAgent::PrometheusBuiltin => "prometheus.io/builtin",
            MonitorAgent::PrometheusOperator => "prometheus.io/operator",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusSpec {
    /// Port on the stats Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Scrape interval used by the ServiceMonitor (e.g. "30s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Namespace for the ServiceMonitor. Defaults to the PgBouncer's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Labels the Prometheus instance selects ServiceMonitors by
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PodTemplateMeta>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PodTemplateSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    /// Immutable after creation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

/// Status of a PgBouncer
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgBouncerStatus {
    #[serde(default)]
    pub phase: PgBouncerPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Hash of the spec that `observed_generation` was reconciled from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_spec_hash: Option<String>,

    /// Why the resource is in its current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Lifecycle phase of a PgBouncer
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
pub enum PgBouncerPhase {
    /// Not yet seen by the controller
    #[default]
    #[serde(rename = "")]
    Pending,
    /// Owned objects are being created or updated
    Provisioning,
    /// Objects are applied, pods are starting
    Initializing,
    /// All replicas are ready and the config is live
    Running,
    /// The spec is invalid or reconciliation failed
    Failed,
    /// Deletion in progress
    Terminating,
}

impl std::fmt::Display for PgBouncerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PgBouncerPhase::Pending => write!(f, "Pending"),
            PgBouncerPhase::Provisioning => write!(f, "Provisioning"),
            PgBouncerPhase::Initializing => write!(f, "Initializing"),
            PgBouncerPhase::Running => write!(f, "Running"),
            PgBouncerPhase::Failed => write!(f, "Failed"),
            PgBouncerPhase::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False, or Unknown
    pub status: String,

    pub reason: String,

    pub message: String,

    pub last_transition_time: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl PgBouncer {
    /// Replica count after defaulting
    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }

    /// Listen port after defaulting
    pub fn listen_port(&self) -> i32 {
        self.spec
            .connection_pool
            .as_ref()
            .and_then(|p| p.port)
            .unwrap_or(DEFAULT_LISTEN_PORT)
    }

    pub fn termination_policy(&self) -> TerminationPolicy {
        self.spec.termination_policy.unwrap_or_default()
    }

    /// The monitoring agent, if monitoring is enabled
    pub fn monitor_agent(&self) -> Option<MonitorAgent> {
        self.spec.monitor.as_ref().and_then(|m| m.agent)
    }

    /// Port of the stats Service
    pub fn exporter_service_port(&self) -> i32 {
        self.spec
            .monitor
            .as_ref()
            .and_then(|m| m.prometheus.as_ref())
            .and_then(|p| p.port)
            .unwrap_or(DEFAULT_EXPORTER_SERVICE_PORT)
    }

    /// Whether clients authenticate against an auth file
    pub fn uses_auth_file(&self) -> bool {
        self.spec
            .connection_pool
            .as_ref()
            .and_then(|p| p.auth_type.as_deref())
            != Some("any")
    }

    pub fn phase(&self) -> PgBouncerPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Fill in every defaulted field. Applying it twice changes nothing.
    pub fn set_defaults(&mut self) {
        let namespace = self.metadata.namespace.clone().unwrap_or_default();
        let spec = &mut self.spec;

        spec.replicas.get_or_insert(1);
        spec.termination_policy.get_or_insert_default();

        let pool = spec.connection_pool.get_or_insert_default();
        pool.port.get_or_insert(DEFAULT_LISTEN_PORT);
        pool.listen_address
            .get_or_insert_with(|| DEFAULT_LISTEN_ADDRESS.to_string());
        pool.pool_mode.get_or_insert_default();

        for db in &mut spec.databases {
            if db.app_binding_ref.namespace.as_deref().is_none_or(str::is_empty) {
                db.app_binding_ref.namespace = Some(namespace.clone());
            }
        }

        if let Some(secret_ref) = spec.user_list_secret_ref.as_mut()
            && secret_ref.namespace.as_deref().is_none_or(str::is_empty)
        {
            secret_ref.namespace = Some(namespace.clone());
        }

        if let Some(monitor) = spec.monitor.as_mut()
            && monitor.agent.is_some()
        {
            monitor
                .prometheus
                .get_or_insert_default()
                .port
                .get_or_insert(DEFAULT_EXPORTER_SERVICE_PORT);
        }
    }
}
