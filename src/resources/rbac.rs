//! ServiceAccount, Role and RoleBinding for the pgbouncer pods
//!
//! All three share the offshoot name. The Role only grants read access to
//! the objects the pods mount.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::core::ObjectMeta;
use kube::{Api, Client, ResourceExt};

use crate::controller::error::Result;
use crate::crd::PgBouncer;
use crate::resources::common::{
    Verb, auth_secret_name, create_or_patch, offshoot_name, owner_reference, standard_labels,
};

fn metadata(pgbouncer: &PgBouncer) -> ObjectMeta {
    let name = offshoot_name(pgbouncer);
    ObjectMeta {
        name: Some(name.clone()),
        namespace: pgbouncer.namespace(),
        labels: Some(standard_labels(&name)),
        owner_references: Some(vec![owner_reference(pgbouncer)]),
        ..Default::default()
    }
}

pub fn generate_service_account(pgbouncer: &PgBouncer) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(pgbouncer),
        ..Default::default()
    }
}

/// Role granting `get` on the PgBouncer's own auth secret and ConfigMap
pub fn generate_role(pgbouncer: &PgBouncer) -> Role {
    Role {
        metadata: metadata(pgbouncer),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec!["secrets".to_string()]),
                resource_names: Some(vec![auth_secret_name(pgbouncer)]),
                verbs: vec!["get".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec!["configmaps".to_string()]),
                resource_names: Some(vec![offshoot_name(pgbouncer)]),
                verbs: vec!["get".to_string()],
                ..Default::default()
            },
        ]),
    }
}

pub fn generate_role_binding(pgbouncer: &PgBouncer) -> RoleBinding {
    let name = offshoot_name(pgbouncer);
    RoleBinding {
        metadata: metadata(pgbouncer),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: pgbouncer.namespace(),
            ..Default::default()
        }]),
    }
}

/// Apply all three RBAC objects. Reports `Created` or `Patched` if any of them changed.
pub async fn ensure_rbac(client: &Client, pgbouncer: &PgBouncer) -> Result<Verb> {
    let ns = pgbouncer.namespace().unwrap_or_default();
    let owner = pgbouncer.name_any();

    let sa_api: Api<ServiceAccount> = Api::namespaced(client.clone(), &ns);
    let role_api: Api<Role> = Api::namespaced(client.clone(), &ns);
    let binding_api: Api<RoleBinding> = Api::namespaced(client.clone(), &ns);

    let verbs = [
        create_or_patch(&sa_api, &owner, &generate_service_account(pgbouncer)).await?,
        create_or_patch(&role_api, &owner, &generate_role(pgbouncer)).await?,
        create_or_patch(&binding_api, &owner, &generate_role_binding(pgbouncer)).await?,
    ];

    Ok(combine_verbs(&verbs))
}

/// Summarize several writes as one verb
pub fn combine_verbs(verbs: &[Verb]) -> Verb {
    if verbs.contains(&Verb::Created) {
        Verb::Created
    } else if verbs.contains(&Verb::Patched) {
        Verb::Patched
    } else {
        Verb::Unchanged
    }
}
