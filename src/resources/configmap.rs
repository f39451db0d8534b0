//! ConfigMap holding the rendered pgbouncer.ini

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, warn};

use crate::controller::error::Result;
use crate::crd::{AppBinding, PgBouncer};
use crate::resources::common::{
    CONFIG_FILE_NAME, Verb, create_or_patch, offshoot_name, owner_reference, standard_labels,
};
use crate::resources::config::{Upstream, render_pgbouncer_ini};

/// Upstreams keyed by AppBinding `(namespace, name)`
pub type UpstreamMap = HashMap<(String, String), Upstream>;

pub fn generate_config_map(pgbouncer: &PgBouncer, ini: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(offshoot_name(pgbouncer)),
            namespace: pgbouncer.namespace(),
            labels: Some(standard_labels(&pgbouncer.name_any())),
            owner_references: Some(vec![owner_reference(pgbouncer)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CONFIG_FILE_NAME.to_string(),
            ini.to_string(),
        )])),
        ..Default::default()
    }
}

/// The pgbouncer.ini stored in a ConfigMap
pub fn rendered_config(config_map: &ConfigMap) -> Option<&str> {
    config_map
        .data
        .as_ref()
        .and_then(|d| d.get(CONFIG_FILE_NAME))
        .map(String::as_str)
}

/// Fetch the AppBindings referenced by a PgBouncer.
///
/// Missing AppBindings are left out and the renderer skips their database
/// entries. Any other read error fails the whole lookup, so a flaky API server
/// never drops a database from the running config.
pub async fn resolve_upstreams(client: &Client, pgbouncer: &PgBouncer) -> Result<UpstreamMap> {
    let own_namespace = pgbouncer.namespace().unwrap_or_default();
    let mut upstreams = UpstreamMap::new();

    for db in &pgbouncer.spec.databases {
        let namespace = db
            .app_binding_ref
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| own_namespace.clone());
        let key = (namespace.clone(), db.app_binding_ref.name.clone());
        if upstreams.contains_key(&key) {
            continue;
        }

        let api: Api<AppBinding> = Api::namespaced(client.clone(), &namespace);
        let Some(app_binding) = api.get_opt(&db.app_binding_ref.name).await? else {
            debug!(
                app_binding = %db.app_binding_ref.name,
                namespace = %namespace,
                "AppBinding not found, skipping database {}", db.alias
            );
            continue;
        };
        match Upstream::from_app_binding(&app_binding) {
            Some(upstream) => {
                upstreams.insert(key, upstream);
            }
            None => warn!(
                app_binding = %db.app_binding_ref.name,
                namespace = %namespace,
                "AppBinding has neither a service nor a url"
            ),
        }
    }

    Ok(upstreams)
}

/// Render the config and write the ConfigMap. Returns the verb and the rendered text.
pub async fn ensure_config_map(
    client: &Client,
    pgbouncer: &PgBouncer,
    auth_file: &str,
) -> Result<(Verb, String)> {
    let upstreams = resolve_upstreams(client, pgbouncer).await?;
    let ini = render_pgbouncer_ini(
        pgbouncer,
        |ns, name| upstreams.get(&(ns.to_string(), name.to_string())).cloned(),
        auth_file,
    );

    let api: Api<ConfigMap> =
        Api::namespaced(client.clone(), &pgbouncer.namespace().unwrap_or_default());
    let desired = generate_config_map(pgbouncer, &ini);
    let verb = create_or_patch(&api, &pgbouncer.name_any(), &desired).await?;

    Ok((verb, ini))
}
