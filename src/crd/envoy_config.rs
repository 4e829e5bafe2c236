use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// EnvoyConfig is the Schema for marin3r's envoyconfigs API
///
/// One EnvoyConfig describes the full set of dynamic resources served to the
/// Envoy node identified by `nodeID`. The same semantic content can be carried
/// in two wire encodings: the legacy `envoyResources` field (one array of
/// serialized documents per section) or the `resources` field (a single list
/// of typed entries). Exactly one of the two should be populated.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "marin3r.3scale.net",
    version = "v1alpha1",
    kind = "EnvoyConfig",
    plural = "envoyconfigs",
    shortname = "ec",
    namespaced,
    status = "EnvoyConfigStatus",
    printcolumn = r#"{"name":"Node ID", "type":"string", "jsonPath":".spec.nodeID"}"#,
    printcolumn = r#"{"name":"Envoy API", "type":"string", "jsonPath":".spec.envoyAPI"}"#,
    printcolumn = r#"{"name":"Desired Version", "type":"string", "jsonPath":".status.desiredVersion"}"#,
    printcolumn = r#"{"name":"Published Version", "type":"string", "jsonPath":".status.publishedVersion"}"#,
    printcolumn = r#"{"name":"Cache State", "type":"string", "jsonPath":".status.cacheState"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyConfigSpec {
    /// ID of the Envoy node this config is served to
    #[serde(rename = "nodeID")]
    pub node_id: String,

    /// Serialization of the embedded resource documents
    #[serde(default = "default_serialization")]
    pub serialization: String,

    /// Legacy encoding: one array of serialized documents per section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envoy_resources: Option<EnvoyResources>,

    /// Typed encoding: a single list of typed resource entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<TypedResource>>,
}

fn default_serialization() -> String {
    "yaml".to_string()
}

/// Per-section resource arrays of the legacy encoding
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyResources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<EnvoyResourceValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<EnvoyResourceValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtimes: Vec<EnvoyResourceValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<EnvoyResourceValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scoped_routes: Vec<EnvoyResourceValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<EnvoyResourceValue>,

    /// References to kubernetes.io/tls Secrets served over SDS
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<EnvoySecretRef>,
}

/// A single serialized document inside the legacy encoding
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyResourceValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The resource document, serialized per `spec.serialization`
    pub value: String,
}

/// Secret reference inside the legacy encoding
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvoySecretRef {
    pub name: String,
}

/// A single entry of the typed encoding
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TypedResource {
    #[serde(rename = "type")]
    pub type_: ResourceType,

    /// Structured resource document; unset for generated secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,

    /// Name of a kubernetes.io/tls Secret to generate the resource from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_from_tls_secret: Option<String>,

    /// How a generated secret is materialized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<Blueprint>,
}

/// Discovery-service resource types accepted by the typed encoding
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ResourceType {
    Cluster,
    Endpoint,
    Runtime,
    Route,
    ScopedRoute,
    Listener,
    Secret,
}

/// Blueprint for secrets generated from TLS secret references
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Blueprint {
    /// Plain TLS certificate source
    TlsCertificate,
    /// Validation context used to verify peer certificates
    ValidationContext,
}

/// Observed status of an EnvoyConfig
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyConfigStatus {
    /// Sync state of this config in the discovery service cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_state: Option<CacheState>,

    /// Version hash the control plane wants to publish
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_version: Option<String>,

    /// Version hash currently being served
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_version: Option<String>,
}

/// All known cache states of an EnvoyConfig
///
/// Before the control plane first reconciles a config the status carries no
/// cache state at all, which is why [`EnvoyConfigStatus::cache_state`] is
/// optional.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum CacheState {
    /// The latest applied configuration is active and valid
    InSync,
    /// The latest configuration was rejected and a previous good one is active
    Rollback,
}
