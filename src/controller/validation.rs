//! Spec validation shared by the controller and the validating webhook

use std::collections::HashSet;

use kube::{Api, Client};

use crate::controller::error::{Error, Result};
use crate::crd::{PgBouncer, PgBouncerVersion};

/// Minimum number of replicas
pub const MIN_REPLICAS: i32 = 1;

/// Validate a PgBouncer against its resolved catalog entry.
///
/// `version` is `None` when `spec.version` names no PgBouncerVersion.
pub fn validate_spec(pgbouncer: &PgBouncer, version: Option<&PgBouncerVersion>) -> Result<()> {
    validate_replicas(pgbouncer)?;
    validate_version(pgbouncer, version)?;
    validate_databases(pgbouncer)?;
    Ok(())
}

fn validate_replicas(pgbouncer: &PgBouncer) -> Result<()> {
    match pgbouncer.spec.replicas {
        None => Err(Error::ValidationError(
            "spec.replicas is missing".to_string(),
        )),
        Some(replicas) if replicas < MIN_REPLICAS => Err(Error::ValidationError(format!(
            "spec.replicas {} is below minimum {}",
            replicas, MIN_REPLICAS
        ))),
        Some(_) => Ok(()),
    }
}

fn validate_version(pgbouncer: &PgBouncer, version: Option<&PgBouncerVersion>) -> Result<()> {
    let requested = pgbouncer.spec.version.trim();
    if requested.is_empty() {
        return Err(Error::ValidationError(
            "spec.version is missing".to_string(),
        ));
    }

    let Some(version) = version else {
        return Err(Error::ValidationError(format!(
            "PgBouncerVersion {} not found",
            requested
        )));
    };

    if version.spec.deprecated {
        return Err(Error::ValidationError(format!(
            "PgBouncerVersion {} is deprecated",
            requested
        )));
    }

    Ok(())
}

fn validate_databases(pgbouncer: &PgBouncer) -> Result<()> {
    let mut seen = HashSet::new();
    for db in &pgbouncer.spec.databases {
        if db.alias.trim().is_empty() {
            return Err(Error::ValidationError(
                "database alias must not be empty".to_string(),
            ));
        }
        if !seen.insert(db.alias.as_str()) {
            return Err(Error::ValidationError(format!(
                "duplicate database alias {}",
                db.alias
            )));
        }
    }
    Ok(())
}

/// Look up the catalog entry a PgBouncer asks for
pub async fn fetch_version(client: &Client, pgbouncer: &PgBouncer) -> Result<Option<PgBouncerVersion>> {
    let name = pgbouncer.spec.version.trim();
    if name.is_empty() {
        return Ok(None);
    }
    let api: Api<PgBouncerVersion> = Api::all(client.clone());
    Ok(api.get_opt(name).await?)
}
