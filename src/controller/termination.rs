//! Cleanup run by the finalizer, per TerminationPolicy
//!
//! Owned objects are garbage collected through their owner references once
//! the PgBouncer is gone. Objects that must survive are orphaned first by
//! dropping that owner reference.

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::{debug, info};

use crate::controller::error::Result;
use crate::crd::{PgBouncer, TerminationPolicy};
use crate::resources::common::{FIELD_MANAGER, auth_secret_name, offshoot_name};
use crate::resources::monitor::delete_service_monitor;

/// What happens to the objects that outlive garbage collection decisions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TerminationPlan {
    pub orphan_secret: bool,
    pub orphan_config_map: bool,
    pub delete_secret: bool,
}

pub fn termination_plan(policy: TerminationPolicy) -> TerminationPlan {
    match policy {
        TerminationPolicy::Pause => TerminationPlan {
            orphan_secret: true,
            orphan_config_map: true,
            delete_secret: false,
        },
        // DoNotTerminate is enforced by the webhook; if deletion gets here anyway it acts like Delete
        TerminationPolicy::Delete | TerminationPolicy::DoNotTerminate => TerminationPlan {
            orphan_secret: true,
            ..Default::default()
        },
        TerminationPolicy::WipeOut => TerminationPlan {
            delete_secret: true,
            ..Default::default()
        },
    }
}

/// Drop the PgBouncer's owner reference from an object so GC leaves it alone
async fn orphan<K>(api: &Api<K>, name: &str, owner_uid: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let Some(existing) = api.get_opt(name).await? else {
        return Ok(false);
    };

    let references = existing.owner_references();
    if !references.iter().any(|r| r.uid == owner_uid) {
        return Ok(false);
    }
    let remaining: Vec<_> = references
        .iter()
        .filter(|r| r.uid != owner_uid)
        .cloned()
        .collect();

    let patch = serde_json::json!({
        "metadata": {
            "ownerReferences": remaining
        }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}

/// Run the termination policy of a PgBouncer that is being deleted
pub async fn run_termination(client: &Client, pgbouncer: &PgBouncer) -> Result<TerminationPlan> {
    let ns = pgbouncer.namespace().unwrap_or_default();
    let uid = pgbouncer.uid().unwrap_or_default();
    let policy = pgbouncer.termination_policy();
    let plan = termination_plan(policy);

    info!(policy = %policy, "Running termination policy");

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &ns);
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &ns);
    let secret_name = auth_secret_name(pgbouncer);

    if plan.orphan_secret && orphan(&secrets, &secret_name, &uid).await? {
        info!(secret = %secret_name, "Orphaned auth secret");
    }
    if plan.orphan_config_map {
        let name = offshoot_name(pgbouncer);
        if orphan(&config_maps, &name, &uid).await? {
            info!(config_map = %name, "Orphaned ConfigMap");
        }
    }
    if plan.delete_secret {
        match secrets.delete(&secret_name, &DeleteParams::default()).await {
            Ok(_) => info!(secret = %secret_name, "Deleted auth secret"),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(secret = %secret_name, "Auth secret already gone");
            }
            Err(e) => return Err(e.into()),
        }
    }

    delete_service_monitor(client, pgbouncer).await?;

    Ok(plan)
}
