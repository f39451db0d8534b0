//! The per-PgBouncer auth secret
//!
//! `<name>-auth` carries the generated admin credentials and, when a user
//! list secret is referenced, the merged auth file pgbouncer reads. Planning
//! is pure; [`ensure_default_secret`] applies the plan against the API.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::PostParams;
use kube::core::ObjectMeta;
use kube::{Api, Client, ResourceExt};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::controller::error::Result;
use crate::crd::PgBouncer;
use crate::resources::common::{
    ADMIN_USER, Verb, auth_secret_name, check_managed, owner_reference, standard_labels,
};

/// Admin auth line, `"pgbouncer" "<password>"`
pub const ADMIN_SECRET_KEY: &str = "pb-admin";
/// Raw admin password
pub const ADMIN_PASSWORD_KEY: &str = "pb-password";
/// Admin line followed by the user list
pub const USER_LIST_SECRET_KEY: &str = "pb-user";

const PASSWORD_SUFFIX_LEN: usize = 16;

/// Generate a random admin password with a unique suffix
pub fn generate_password() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..PASSWORD_SUFFIX_LEN)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect();
    format!("{}-{}", ADMIN_USER, suffix)
}

/// The auth file line for the admin user
pub fn admin_line(password: &str) -> String {
    format!("\"{}\" \"{}\"", ADMIN_USER, password)
}

/// Decode a secret's data into strings
pub fn secret_string_data(secret: &Secret) -> BTreeMap<String, String> {
    secret
        .data
        .as_ref()
        .map(|data| {
            data.iter()
                .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// The user list stored in a user-supplied secret.
///
/// The first non-empty key (in key order) holds the `"user" "password"` lines.
pub fn user_list_contents(secret: &Secret) -> Option<String> {
    secret_string_data(secret)
        .into_values()
        .find(|v| !v.trim().is_empty())
}

/// Desired data of the auth secret
pub fn default_secret_data(password: &str, user_list: Option<&str>) -> BTreeMap<String, String> {
    let admin = admin_line(password);
    let mut data = BTreeMap::from([
        (ADMIN_PASSWORD_KEY.to_string(), password.to_string()),
        (ADMIN_SECRET_KEY.to_string(), admin.clone()),
    ]);
    if let Some(users) = user_list {
        data.insert(
            USER_LIST_SECRET_KEY.to_string(),
            format!("{}\n{}", admin, users),
        );
    }
    data
}

/// Hex digest of the auth secret's data, stamped on the pod template
pub fn auth_hash(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Result of planning the auth secret
#[derive(Clone, Debug)]
pub struct SecretPlan {
    pub verb: Verb,
    pub secret: Secret,
    pub admin_password: String,
    pub auth_hash: String,
}

impl SecretPlan {
    pub fn has_user_list(&self) -> bool {
        self.secret
            .data
            .as_ref()
            .is_some_and(|d| d.contains_key(USER_LIST_SECRET_KEY))
    }
}

/// Work out what the auth secret should contain and how to get there.
///
/// An existing admin password is always kept.
pub fn plan_default_secret(
    pgbouncer: &PgBouncer,
    existing: Option<&Secret>,
    user_list: Option<&str>,
) -> SecretPlan {
    let existing_data = existing.map(secret_string_data).unwrap_or_default();
    let admin_password = existing_data
        .get(ADMIN_PASSWORD_KEY)
        .filter(|p| !p.is_empty())
        .cloned()
        .unwrap_or_else(generate_password);

    let data = default_secret_data(&admin_password, user_list);
    let auth_hash = auth_hash(&data);

    let verb = match existing {
        None => Verb::Created,
        Some(_) if existing_data == data => Verb::Unchanged,
        Some(_) => Verb::Patched,
    };

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(auth_secret_name(pgbouncer)),
            namespace: pgbouncer.namespace(),
            labels: Some(standard_labels(&pgbouncer.name_any())),
            owner_references: Some(vec![owner_reference(pgbouncer)]),
            resource_version: existing.and_then(|s| s.metadata.resource_version.clone()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k, ByteString(v.into_bytes())))
                .collect(),
        ),
        ..Default::default()
    };

    SecretPlan {
        verb,
        secret,
        admin_password,
        auth_hash,
    }
}

/// Outcome of [`ensure_default_secret`]
#[derive(Clone, Debug)]
pub struct DefaultSecret {
    pub verb: Verb,
    pub admin_password: String,
    pub has_user_list: bool,
    pub auth_hash: String,
    /// A user list secret is referenced but does not exist yet
    pub user_secret_missing: bool,
}

/// Fetch the referenced user list, if any
async fn fetch_user_list(client: &Client, pgbouncer: &PgBouncer) -> Result<(Option<String>, bool)> {
    let Some(reference) = &pgbouncer.spec.user_list_secret_ref else {
        return Ok((None, false));
    };
    let namespace = reference
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .or_else(|| pgbouncer.namespace())
        .unwrap_or_default();

    let api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    match api.get_opt(&reference.name).await? {
        Some(secret) => Ok((user_list_contents(&secret), false)),
        None => {
            debug!(secret = %reference.name, namespace = %namespace, "User list secret not found");
            Ok((None, true))
        }
    }
}

/// Make sure `<name>-auth` exists and reflects the current user list.
///
/// Changes are written with a resourceVersion-guarded replace, so a
/// concurrent edit fails with a conflict and the next reconcile retries.
pub async fn ensure_default_secret(client: &Client, pgbouncer: &PgBouncer) -> Result<DefaultSecret> {
    let ns = pgbouncer.namespace().unwrap_or_default();
    let api: Api<Secret> = Api::namespaced(client.clone(), &ns);
    let name = auth_secret_name(pgbouncer);

    let existing = api.get_opt(&name).await?;
    if let Some(secret) = &existing {
        check_managed(secret, &pgbouncer.name_any())?;
    }

    let (user_list, user_secret_missing) = fetch_user_list(client, pgbouncer).await?;
    let plan = plan_default_secret(pgbouncer, existing.as_ref(), user_list.as_deref());

    match plan.verb {
        Verb::Created => {
            api.create(&PostParams::default(), &plan.secret).await?;
            info!(secret = %name, "Created auth secret");
        }
        Verb::Patched => {
            api.replace(&name, &PostParams::default(), &plan.secret)
                .await?;
            info!(secret = %name, "Updated auth secret");
        }
        Verb::Unchanged => {}
    }

    Ok(DefaultSecret {
        verb: plan.verb,
        has_user_list: plan.has_user_list(),
        admin_password: plan.admin_password,
        auth_hash: plan.auth_hash,
        user_secret_missing,
    })
}
