//! Services in front of the pgbouncer pods
//!
//! - the primary Service `<name>` clients connect through
//! - the stats Service `<name>-stats` exposing the exporter, only while
//!   monitoring is enabled
//! - the governing headless Service shared by every StatefulSet in a namespace

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client, ResourceExt};
use tracing::info;

use crate::controller::error::{Error, Result};
use crate::crd::{MonitorAgent, PgBouncer};
use crate::resources::common::{
    COMPONENT_LABEL, FIELD_MANAGER, MANAGED_BY_LABEL, NAME_LABEL, Verb, check_managed, create_or_patch,
    offshoot_name, owner_reference, selector_labels, standard_labels, stats_service_name,
};
use crate::resources::statefulset::{DB_PORT_NAME, EXPORTER_PORT_NAME};

/// Annotation naming the agent that scrapes the stats Service
pub const MONITORING_AGENT_ANNOTATION: &str = "monitoring.appscode.com/agent";

/// Path the exporter serves metrics on
pub const METRICS_PATH: &str = "/metrics";

/// Generate the primary Service
pub fn generate_primary_service(pgbouncer: &PgBouncer) -> Service {
    let name = offshoot_name(pgbouncer);
    let template = pgbouncer.spec.service_template.clone().unwrap_or_default();

    Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: pgbouncer.namespace(),
            labels: Some(standard_labels(&name)),
            annotations: (!template.annotations.is_empty()).then_some(template.annotations),
            owner_references: Some(vec![owner_reference(pgbouncer)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&name)),
            ports: Some(vec![ServicePort {
                name: Some(DB_PORT_NAME.to_string()),
                port: pgbouncer.listen_port(),
                target_port: Some(IntOrString::String(DB_PORT_NAME.to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some(template.type_.unwrap_or_else(|| "ClusterIP".to_string())),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the stats Service, or `None` when monitoring is disabled
pub fn generate_stats_service(pgbouncer: &PgBouncer) -> Option<Service> {
    let agent = pgbouncer.monitor_agent()?;
    let name = offshoot_name(pgbouncer);
    let port = pgbouncer.exporter_service_port();

    let mut labels = standard_labels(&name);
    labels.insert(COMPONENT_LABEL.to_string(), "metrics".to_string());

    let mut annotations = BTreeMap::from([(
        MONITORING_AGENT_ANNOTATION.to_string(),
        agent.as_str().to_string(),
    )]);
    if agent == MonitorAgent::PrometheusBuiltin {
        annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
        annotations.insert("prometheus.io/port".to_string(), port.to_string());
        annotations.insert("prometheus.io/path".to_string(), METRICS_PATH.to_string());
    }

    Some(Service {
        metadata: ObjectMeta {
            name: Some(stats_service_name(pgbouncer)),
            namespace: pgbouncer.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(pgbouncer)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&name)),
            ports: Some(vec![ServicePort {
                name: Some(EXPORTER_PORT_NAME.to_string()),
                port,
                target_port: Some(IntOrString::String(EXPORTER_PORT_NAME.to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Generate the governing headless Service.
///
/// It has no owner so that it survives the PgBouncers that share it.
pub fn generate_governing_service(name: &str, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                FIELD_MANAGER.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(BTreeMap::from([(
                NAME_LABEL.to_string(),
                "pgbouncer".to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some(DB_PORT_NAME.to_string()),
                port: 5432,
                ..Default::default()
            }]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub async fn ensure_primary_service(client: &Client, pgbouncer: &PgBouncer) -> Result<Verb> {
    let api: Api<Service> =
        Api::namespaced(client.clone(), &pgbouncer.namespace().unwrap_or_default());
    create_or_patch(&api, &pgbouncer.name_any(), &generate_primary_service(pgbouncer)).await
}

/// Create or patch the stats Service while monitoring is on, delete it otherwise
pub async fn ensure_stats_service(client: &Client, pgbouncer: &PgBouncer) -> Result<Verb> {
    let api: Api<Service> =
        Api::namespaced(client.clone(), &pgbouncer.namespace().unwrap_or_default());

    match generate_stats_service(pgbouncer) {
        Some(desired) => create_or_patch(&api, &pgbouncer.name_any(), &desired).await,
        None => {
            let name = stats_service_name(pgbouncer);
            let Some(existing) = api.get_opt(&name).await? else {
                return Ok(Verb::Unchanged);
            };
            check_managed(&existing, &pgbouncer.name_any())?;
            api.delete(&name, &DeleteParams::default()).await?;
            info!(service = %name, "Deleted stats service, monitoring disabled");
            Ok(Verb::Patched)
        }
    }
}

/// Reject a PgBouncer whose own Services would take the governing Service's name
pub fn check_governing_collision(pgbouncer: &PgBouncer, governing: &str) -> Result<()> {
    let name = pgbouncer.name_any();
    if name == governing || stats_service_name(pgbouncer) == governing {
        return Err(Error::NameCollision(format!(
            "Service {} is the governing service shared by every PgBouncer in the namespace; PgBouncer {} must use another name",
            governing, name
        )));
    }
    Ok(())
}

/// Create the governing Service if it does not exist yet. It is never patched.
pub async fn ensure_governing_service(client: &Client, name: &str, namespace: &str) -> Result<Verb> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    if api.get_opt(name).await?.is_some() {
        return Ok(Verb::Unchanged);
    }

    let desired = generate_governing_service(name, namespace);
    match api.create(&PostParams::default(), &desired).await {
        Ok(_) => {
            info!(service = %name, namespace = %namespace, "Created governing service");
            Ok(Verb::Created)
        }
        // Another PgBouncer in the namespace created it first
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(Verb::Unchanged),
        Err(e) => Err(e.into()),
    }
}
