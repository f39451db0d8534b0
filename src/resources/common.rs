//! Common utilities for Kubernetes resource generation
//!
//! Shared constants, labels, and owner references used by every generator,
//! plus the create-or-patch primitive the reconcilers write through.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::PgBouncer;

/// API version for the PgBouncer CRD
pub const API_VERSION: &str = "pgbouncer-operator.smoketurner.com/v1alpha2";

/// Kind for the PgBouncer CRD
pub const KIND: &str = "PgBouncer";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "pgbouncer-operator";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";

/// Identifies the owning PgBouncer on every generated object
pub const PGBOUNCER_LABEL: &str = "pgbouncer-operator.smoketurner.com/pgbouncer";

/// Admin user baked into every generated config
pub const ADMIN_USER: &str = "pgbouncer";

/// Container name of the proxy
pub const PGBOUNCER_CONTAINER: &str = "pgbouncer";

/// Where the rendered ConfigMap is mounted
pub const CONFIG_MOUNT_PATH: &str = "/etc/config";

/// Key of the rendered config inside the ConfigMap
pub const CONFIG_FILE_NAME: &str = "pgbouncer.ini";

/// Where the auth secret is mounted
pub const SECRETS_MOUNT_PATH: &str = "/var/run/pgbouncer/secrets";

/// Full path of the rendered config inside the pod
pub fn config_file_path() -> String {
    format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_FILE_NAME)
}

/// Name shared by the StatefulSet, ConfigMap, primary Service and AppBinding
pub fn offshoot_name(pgbouncer: &PgBouncer) -> String {
    pgbouncer.name_any()
}

/// Name of the auth secret
pub fn auth_secret_name(pgbouncer: &PgBouncer) -> String {
    format!("{}-auth", pgbouncer.name_any())
}

/// Name of the stats Service
pub fn stats_service_name(pgbouncer: &PgBouncer) -> String {
    format!("{}-stats", pgbouncer.name_any())
}

/// Generate an owner reference for a PgBouncer
///
/// Owned objects are garbage collected when the PgBouncer is deleted.
pub fn owner_reference(pgbouncer: &PgBouncer) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: pgbouncer.name_any(),
        uid: pgbouncer.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels selecting the pods of one PgBouncer
pub fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), "pgbouncer".to_string()),
        (INSTANCE_LABEL.to_string(), name.to_string()),
        (PGBOUNCER_LABEL.to_string(), name.to_string()),
    ])
}

/// Generate standard labels for all resources belonging to a PgBouncer
pub fn standard_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(name);
    labels.insert(COMPONENT_LABEL.to_string(), "connection-pooler".to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    labels
}

/// Outcome of an idempotent write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Created,
    Patched,
    Unchanged,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Created => write!(f, "created"),
            Verb::Patched => write!(f, "patched"),
            Verb::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Check that an existing object belongs to this PgBouncer.
///
/// Objects without our managed-by label, or labelled for another instance,
/// are never overwritten.
pub fn check_managed<K>(existing: &K, pgbouncer_name: &str) -> Result<()>
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    check_managed_meta(existing.meta(), &K::kind(&Default::default()), pgbouncer_name)
}

/// [`check_managed`] for objects whose kind is only known at runtime
pub fn check_managed_meta(meta: &ObjectMeta, kind: &str, pgbouncer_name: &str) -> Result<()> {
    let labels = meta.labels.as_ref();
    let managed_by = labels.and_then(|l| l.get(MANAGED_BY_LABEL));
    let instance = labels.and_then(|l| l.get(PGBOUNCER_LABEL));

    if managed_by.map(String::as_str) == Some(FIELD_MANAGER)
        && instance.map(String::as_str) == Some(pgbouncer_name)
    {
        return Ok(());
    }

    Err(Error::NameCollision(format!(
        "{} {} already exists and is not managed by PgBouncer {}",
        kind,
        meta.name.as_deref().unwrap_or_default(),
        pgbouncer_name
    )))
}

/// Create the object if missing, otherwise server-side apply it.
///
/// The verb is derived from the resourceVersion, which the API server leaves
/// untouched when an apply is a no-op.
pub async fn create_or_patch<K>(api: &Api<K>, owner_name: &str, desired: &K) -> Result<Verb>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Serialize
        + DeserializeOwned
        + Clone
        + fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    let name = desired.name_any();

    let Some(existing) = api.get_opt(&name).await? else {
        api.create(&PostParams::default(), desired).await?;
        debug!(resource = %name, "Created {}", K::kind(&Default::default()));
        return Ok(Verb::Created);
    };

    check_managed(&existing, owner_name)?;

    let params = PatchParams::apply(FIELD_MANAGER).force();
    let patched = api.patch(&name, &params, &Patch::Apply(desired)).await?;

    if patched.resource_version() == existing.resource_version() {
        Ok(Verb::Unchanged)
    } else {
        debug!(resource = %name, "Patched {}", K::kind(&Default::default()));
        Ok(Verb::Patched)
    }
}
