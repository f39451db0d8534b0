//! Reverse index from referenced objects to the PgBouncers that use them
//!
//! User list secrets and AppBindings are not owned, so changes to them are
//! mapped back to PgBouncers by scanning the controller's reflector store.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::runtime::reflector::{ObjectRef, Store};

use crate::crd::{AppBinding, PgBouncer};

/// Namespaces whose objects never trigger a reconcile
pub const SYSTEM_NAMESPACES: [&str; 2] = ["kube-system", "kube-public"];

pub fn is_system_namespace(namespace: &str) -> bool {
    SYSTEM_NAMESPACES.contains(&namespace)
}

fn effective_namespace(reference: Option<&str>, pgbouncer: &PgBouncer) -> String {
    reference
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .or_else(|| pgbouncer.namespace())
        .unwrap_or_default()
}

/// PgBouncers whose `userListSecretRef` points at `secret`
pub fn pgbouncers_for_secret(
    pgbouncers: &[Arc<PgBouncer>],
    secret: &Secret,
) -> Vec<ObjectRef<PgBouncer>> {
    let name = secret.name_any();
    let namespace = secret.namespace().unwrap_or_default();
    if is_system_namespace(&namespace) {
        return Vec::new();
    }

    pgbouncers
        .iter()
        .filter(|pb| {
            pb.spec.user_list_secret_ref.as_ref().is_some_and(|r| {
                r.name == name && effective_namespace(r.namespace.as_deref(), pb) == namespace
            })
        })
        .map(|pb| ObjectRef::from_obj(pb.as_ref()))
        .collect()
}

/// PgBouncers with a database entry backed by `app_binding`
pub fn pgbouncers_for_app_binding(
    pgbouncers: &[Arc<PgBouncer>],
    app_binding: &AppBinding,
) -> Vec<ObjectRef<PgBouncer>> {
    let name = app_binding.name_any();
    let namespace = app_binding.namespace().unwrap_or_default();
    if is_system_namespace(&namespace) {
        return Vec::new();
    }

    pgbouncers
        .iter()
        .filter(|pb| {
            pb.spec.databases.iter().any(|db| {
                db.app_binding_ref.name == name
                    && effective_namespace(db.app_binding_ref.namespace.as_deref(), pb)
                        == namespace
            })
        })
        .map(|pb| ObjectRef::from_obj(pb.as_ref()))
        .collect()
}

/// Mapper for `Controller::watches` on Secrets
pub fn secret_mapper(store: Store<PgBouncer>) -> impl Fn(Secret) -> Vec<ObjectRef<PgBouncer>> {
    move |secret| pgbouncers_for_secret(&store.state(), &secret)
}

/// Mapper for `Controller::watches` on AppBindings
pub fn app_binding_mapper(
    store: Store<PgBouncer>,
) -> impl Fn(AppBinding) -> Vec<ObjectRef<PgBouncer>> {
    move |app_binding| pgbouncers_for_app_binding(&store.state(), &app_binding)
}
