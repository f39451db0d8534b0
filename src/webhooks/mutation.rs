//! Defaulting for incoming PgBouncers
//!
//! The patch is the JSON diff between the object as received and the object
//! after [`PgBouncer::set_defaults`].

use crate::crd::PgBouncer;

/// JSON patch that fills in every defaulted field of `pgbouncer`.
///
/// `namespace` is the request namespace; Create requests often carry the
/// object without `metadata.namespace`.
pub fn default_patch(
    pgbouncer: &PgBouncer,
    namespace: Option<&str>,
) -> Result<json_patch::Patch, serde_json::Error> {
    let mut incoming = pgbouncer.clone();
    if incoming.metadata.namespace.is_none() {
        incoming.metadata.namespace = namespace.map(str::to_string);
    }

    let mut defaulted = incoming.clone();
    defaulted.set_defaults();

    let before = serde_json::to_value(&incoming)?;
    let after = serde_json::to_value(&defaulted)?;
    Ok(json_patch::diff(&before, &after))
}
