//! AppBinding published for each PgBouncer so other tools can discover the pooler

use kube::core::ObjectMeta;
use kube::{Api, Client, ResourceExt};

use crate::controller::error::Result;
use crate::crd::{AppBinding, AppBindingSpec, ClientConfig, LocalObjectReference, PgBouncer, ServiceReference};
use crate::resources::common::{
    Verb, auth_secret_name, create_or_patch, offshoot_name, owner_reference, standard_labels,
};

/// AppBinding type advertised for poolers
pub const APP_BINDING_TYPE: &str = "pgbouncer-operator.smoketurner.com/pgbouncer";

pub fn generate_app_binding(pgbouncer: &PgBouncer) -> AppBinding {
    let name = offshoot_name(pgbouncer);
    let annotations = pgbouncer
        .spec
        .service_template
        .as_ref()
        .map(|t| t.annotations.clone())
        .filter(|a| !a.is_empty());

    AppBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: pgbouncer.namespace(),
            labels: Some(standard_labels(&name)),
            annotations,
            owner_references: Some(vec![owner_reference(pgbouncer)]),
            ..Default::default()
        },
        spec: AppBindingSpec {
            type_: Some(APP_BINDING_TYPE.to_string()),
            client_config: ClientConfig {
                url: None,
                service: Some(ServiceReference {
                    scheme: Some("postgresql".to_string()),
                    name,
                    port: Some(pgbouncer.listen_port()),
                    path: None,
                    query: None,
                }),
            },
            secret: Some(LocalObjectReference {
                name: auth_secret_name(pgbouncer),
            }),
        },
    }
}

pub async fn ensure_app_binding(client: &Client, pgbouncer: &PgBouncer) -> Result<Verb> {
    let api: Api<AppBinding> =
        Api::namespaced(client.clone(), &pgbouncer.namespace().unwrap_or_default());
    create_or_patch(&api, &pgbouncer.name_any(), &generate_app_binding(pgbouncer)).await
}
