use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PgBouncerVersion is a cluster-scoped catalog entry mapping a version name
/// to the images the StatefulSet runs.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "pgbouncer-operator.smoketurner.com",
    version = "v1alpha2",
    kind = "PgBouncerVersion",
    plural = "pgbouncerversions",
    shortname = "pbversion",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Server", "type":"string", "jsonPath":".spec.server.image"}"#,
    printcolumn = r#"{"name":"Deprecated", "type":"boolean", "jsonPath":".spec.deprecated"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgBouncerVersionSpec {
    /// pgbouncer release, e.g. "1.17.0"
    pub version: String,

    pub server: ImageSpec,

    pub exporter: ImageSpec,

    /// Deprecated versions are rejected for new and updated PgBouncers
    #[serde(default)]
    pub deprecated: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub image: String,
}
