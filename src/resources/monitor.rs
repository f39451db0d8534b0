//! Prometheus operator ServiceMonitor for the stats Service
//!
//! ServiceMonitor is a third-party CRD, so it is handled as a
//! [`DynamicObject`] and the operator keeps working on clusters without it
//! until a PgBouncer actually asks for `prometheus.io/operator`.

use std::collections::BTreeMap;

use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::crd::{MonitorAgent, PgBouncer};
use crate::resources::common::{
    COMPONENT_LABEL, FIELD_MANAGER, Verb, check_managed_meta, owner_reference, selector_labels,
    standard_labels, stats_service_name,
};
use crate::resources::service::METRICS_PATH;
use crate::resources::statefulset::EXPORTER_PORT_NAME;

const MONITORING_API_GROUP: &str = "monitoring.coreos.com";
const MONITORING_API_VERSION: &str = "v1";
const SERVICE_MONITOR_KIND: &str = "ServiceMonitor";

fn service_monitor_resource() -> ApiResource {
    ApiResource {
        group: MONITORING_API_GROUP.to_string(),
        version: MONITORING_API_VERSION.to_string(),
        kind: SERVICE_MONITOR_KIND.to_string(),
        api_version: format!("{}/{}", MONITORING_API_GROUP, MONITORING_API_VERSION),
        plural: "servicemonitors".to_string(),
    }
}

/// Namespace the ServiceMonitor lives in
pub fn service_monitor_namespace(pgbouncer: &PgBouncer) -> String {
    pgbouncer
        .spec
        .monitor
        .as_ref()
        .and_then(|m| m.prometheus.as_ref())
        .and_then(|p| p.namespace.clone())
        .filter(|ns| !ns.is_empty())
        .or_else(|| pgbouncer.namespace())
        .unwrap_or_default()
}

/// Generate the ServiceMonitor, or `None` unless the agent is `prometheus.io/operator`
pub fn generate_service_monitor(pgbouncer: &PgBouncer) -> Option<DynamicObject> {
    if pgbouncer.monitor_agent()? != MonitorAgent::PrometheusOperator {
        return None;
    }

    let name = stats_service_name(pgbouncer);
    let pgbouncer_ns = pgbouncer.namespace().unwrap_or_default();
    let monitor_ns = service_monitor_namespace(pgbouncer);
    let prometheus = pgbouncer
        .spec
        .monitor
        .as_ref()
        .and_then(|m| m.prometheus.clone())
        .unwrap_or_default();

    let mut labels = prometheus.labels.clone();
    labels.extend(standard_labels(&pgbouncer.name_any()));

    // Must match the labels of the stats Service
    let mut match_labels: BTreeMap<String, String> = selector_labels(&pgbouncer.name_any());
    match_labels.insert(COMPONENT_LABEL.to_string(), "metrics".to_string());

    let mut endpoint = json!({
        "port": EXPORTER_PORT_NAME,
        "path": METRICS_PATH,
    });
    if let Some(interval) = prometheus.interval.filter(|i| !i.is_empty()) {
        endpoint["interval"] = json!(interval);
    }

    let mut obj = DynamicObject::new(&name, &service_monitor_resource());
    obj.metadata = ObjectMeta {
        name: Some(name),
        namespace: Some(monitor_ns.clone()),
        labels: Some(labels),
        // Owner references cannot cross namespaces; cleanup handles the rest
        owner_references: (monitor_ns == pgbouncer_ns).then(|| vec![owner_reference(pgbouncer)]),
        ..Default::default()
    };
    obj.data = json!({
        "spec": {
            "selector": { "matchLabels": match_labels },
            "namespaceSelector": { "matchNames": [pgbouncer_ns] },
            "endpoints": [endpoint],
        }
    });

    Some(obj)
}

/// Apply the ServiceMonitor when requested, remove any previous one otherwise
pub async fn ensure_monitor(client: &Client, pgbouncer: &PgBouncer) -> Result<Verb> {
    let Some(desired) = generate_service_monitor(pgbouncer) else {
        return delete_service_monitor(client, pgbouncer).await;
    };

    let ns = desired.namespace().unwrap_or_default();
    let name = desired.name_any();
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), &ns, &service_monitor_resource());

    // get_opt reports a missing CRD as a missing object; the apply below surfaces it
    let existing = api.get_opt(&name).await?;
    if let Some(existing) = &existing {
        check_managed_meta(&existing.metadata, SERVICE_MONITOR_KIND, &pgbouncer.name_any())?;
    }

    let patched = match api
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&desired),
        )
        .await
    {
        Ok(patched) => patched,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            return Err(Error::InvalidConfig(format!(
                "monitor agent {} requires the {}/{} CRD, which is not installed",
                MonitorAgent::PrometheusOperator.as_str(),
                MONITORING_API_GROUP,
                SERVICE_MONITOR_KIND
            )));
        }
        Err(e) => return Err(e.into()),
    };

    Ok(match existing {
        None => {
            info!(service_monitor = %name, namespace = %ns, "Created ServiceMonitor");
            Verb::Created
        }
        Some(existing) if existing.resource_version() == patched.resource_version() => {
            Verb::Unchanged
        }
        Some(_) => Verb::Patched,
    })
}

/// Remove ServiceMonitors this PgBouncer created, in its own namespace and in the configured one
pub async fn delete_service_monitor(client: &Client, pgbouncer: &PgBouncer) -> Result<Verb> {
    let name = stats_service_name(pgbouncer);
    let mut namespaces = vec![pgbouncer.namespace().unwrap_or_default()];
    let configured = service_monitor_namespace(pgbouncer);
    if !namespaces.contains(&configured) {
        namespaces.push(configured);
    }

    let mut verb = Verb::Unchanged;
    for ns in namespaces {
        let api: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &ns, &service_monitor_resource());
        // Also None when the CRD is not installed
        let Some(existing) = api.get_opt(&name).await? else {
            continue;
        };
        if check_managed_meta(&existing.metadata, SERVICE_MONITOR_KIND, &pgbouncer.name_any())
            .is_err()
        {
            debug!(service_monitor = %name, namespace = %ns, "Skipping unmanaged ServiceMonitor");
            continue;
        }
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(service_monitor = %name, namespace = %ns, "Deleted ServiceMonitor");
                verb = Verb::Patched;
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(verb)
}
