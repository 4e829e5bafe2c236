use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DiscoveryService deploys a marin3r discovery service in its namespace
///
/// The operator materializes the xDS server, its certificates and its RBAC
/// from this resource; proxies reference it by name.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "operator.marin3r.3scale.net",
    version = "v1alpha1",
    kind = "DiscoveryService",
    plural = "discoveryservices",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryServiceSpec {
    /// Discovery service container image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Enable debug logging on the discovery service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

/// EnvoyDeployment runs a dedicated Envoy deployment wired to a
/// DiscoveryService and an EnvoyConfig
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "operator.marin3r.3scale.net",
    version = "v1alpha1",
    kind = "EnvoyDeployment",
    plural = "envoydeployments",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyDeploymentSpec {
    /// Name of the DiscoveryService the proxy connects to
    pub discovery_service_ref: String,

    /// Name of the EnvoyConfig served to the proxy
    pub envoy_config_ref: String,

    /// Exposed container ports, one per configured listener
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<EnvoyPort>,

    /// Envoy container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<ReplicasSpec>,
}

/// A named container port of an EnvoyDeployment
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyPort {
    pub name: String,
    pub port: i32,
}

/// Replica configuration of an EnvoyDeployment
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicasSpec {
    /// Fixed replica count (as opposed to autoscaler-driven)
    #[serde(rename = "static", default, skip_serializing_if = "Option::is_none")]
    pub static_: Option<i32>,
}
