//! PodDisruptionBudget for multi-replica PgBouncers
//!
//! Voluntary disruptions (node drains, upgrades) may take down at most one
//! pod at a time. A single replica gets no PDB so drains are never blocked.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DeleteParams;
use kube::core::ObjectMeta;
use kube::{Api, Client, ResourceExt};
use tracing::info;

use crate::controller::error::Result;
use crate::crd::PgBouncer;
use crate::resources::common::{
    Verb, check_managed, create_or_patch, offshoot_name, owner_reference, selector_labels,
    standard_labels,
};

/// Generate the PDB, or `None` for a single replica
pub fn generate_pdb(pgbouncer: &PgBouncer) -> Option<PodDisruptionBudget> {
    let replicas = pgbouncer.replicas();
    if replicas <= 1 {
        return None;
    }
    let name = offshoot_name(pgbouncer);

    Some(PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: pgbouncer.namespace(),
            labels: Some(standard_labels(&name)),
            owner_references: Some(vec![owner_reference(pgbouncer)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(&name)),
                ..Default::default()
            }),
            // Unhealthy pods may always be evicted
            unhealthy_pod_eviction_policy: Some("AlwaysAllow".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Create or patch the PDB for more than one replica, delete it otherwise
pub async fn ensure_pdb(client: &Client, pgbouncer: &PgBouncer) -> Result<Verb> {
    let api: Api<PodDisruptionBudget> =
        Api::namespaced(client.clone(), &pgbouncer.namespace().unwrap_or_default());

    if let Some(desired) = generate_pdb(pgbouncer) {
        return create_or_patch(&api, &pgbouncer.name_any(), &desired).await;
    }

    let name = offshoot_name(pgbouncer);
    let Some(existing) = api.get_opt(&name).await? else {
        return Ok(Verb::Unchanged);
    };
    check_managed(&existing, &pgbouncer.name_any())?;
    api.delete(&name, &DeleteParams::default()).await?;
    info!(pdb = %name, "Deleted PodDisruptionBudget, single replica");
    Ok(Verb::Patched)
}
