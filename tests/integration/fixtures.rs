//! Scenario fixtures: Envoy documents, unique names and fleet setup/teardown

use std::sync::Arc;

use kube::{Api, Client};
use serde_json::json;
use uuid::Uuid;

use marin3r_e2e::crd::{
    DiscoveryService, DiscoveryServiceSpec, EnvoyConfig, EnvoyResourceValue, ResourceType,
};
use marin3r_e2e::{
    build_config, ConfigSections, Encoding, EnvoyFleet, FleetOptions, HttpbinBackend, Lifecycle,
    Managed, Settings,
};

use crate::{SharedTestCluster, TestNamespace};

/// Initialize tracing and connect to the shared cluster
pub async fn init_test() -> Arc<SharedTestCluster> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,kube=warn,marin3r_e2e=debug")
        .with_test_writer()
        .try_init();

    SharedTestCluster::get()
        .await
        .expect("Failed to connect to cluster")
}

/// Unique resource name to avoid conflicts across test runs
pub fn unique_name(prefix: &str) -> String {
    let suffix = Uuid::new_v4().to_string();
    format!("{}-{}", prefix, &suffix[..8])
}

// =============================================================================
// Envoy configuration documents
// =============================================================================

/// Listener with an inline route config forwarding everything to `cluster`
pub fn simple_listener(port: i32, cluster: &str) -> String {
    format!(
        r#"
name: http
address:
    socket_address:
      address: 0.0.0.0
      port_value: {port}
filter_chains:
    - filters:
        - name: envoy.http_connection_manager
          typed_config:
            "@type": type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager
            stat_prefix: local
            use_remote_address: true
            route_config:
              name: local_route
              virtual_hosts:
              - name: local_service
                domains: ['*']
                routes:
                - {{ match: {{ prefix: "/" }}, route: {{ cluster: "{cluster}" }} }}
            http_filters:
                - name: envoy.filters.http.router
                  typed_config:
                    "@type": type.googleapis.com/envoy.extensions.filters.http.router.v3.Router
"#
    )
}

/// Listener fetching its route configuration over RDS
pub fn rds_listener(port: i32, route_config: &str) -> String {
    format!(
        r#"
name: http
address:
    socket_address:
      address: 0.0.0.0
      port_value: {port}
filter_chains:
    - filters:
        - name: envoy.http_connection_manager
          typed_config:
            "@type": type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager
            stat_prefix: local
            use_remote_address: true
            rds: {{ route_config_name: "{route_config}", config_source: {{ ads: {{}}, resource_api_version: "V3" }} }}
            http_filters:
                - name: envoy.filters.http.router
                  typed_config:
                    "@type": type.googleapis.com/envoy.extensions.filters.http.router.v3.Router
"#
    )
}

/// Standalone route configuration forwarding everything to `cluster`
pub fn route_config_document(name: &str, cluster: &str) -> String {
    format!(
        r#"
name: {name}
virtual_hosts:
  - name: all
    domains: ["*"]
    routes:
      - match:
            prefix: "/"
        route:
            cluster: {cluster}
"#
    )
}

/// Listener terminating TLS with SDS-served certificates and requiring a
/// client certificate
pub fn tls_listener(port: i32, cert_secret: &str, ca_secret: &str, cluster: &str) -> String {
    format!(
        r#"
name: http
address:
    socket_address:
      address: 0.0.0.0
      port_value: {port}
filter_chains:
  - transport_socket:
      name: envoy.transport_sockets.tls
      typed_config:
        "@type": type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext
        require_client_certificate: true
        common_tls_context:
            tls_certificate_sds_secret_configs:
              - name: {cert_secret}
                sds_config: {{ ads: {{}}, resource_api_version: "V3" }}
            validation_context_sds_secret_config:
              name: {ca_secret}
              sds_config: {{ ads: {{}}, resource_api_version: "V3" }}
    filters:
    - name: envoy.http_connection_manager
      typed_config:
        "@type": type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager
        stat_prefix: local
        use_remote_address: true
        route_config:
          name: local_route
          virtual_hosts:
          - name: local_service
            domains: ['*']
            routes:
            - {{ match: {{ prefix: "/" }}, route: {{ cluster: "{cluster}" }} }}
        http_filters:
            - name: envoy.filters.http.router
              typed_config:
                "@type": type.googleapis.com/envoy.extensions.filters.http.router.v3.Router
"#
    )
}

/// Cluster pointing at a resolvable backend host
pub fn backend_cluster(name: &str, host: &str, port: i32) -> serde_json::Value {
    json!({
        "name": name,
        "connect_timeout": "0.25s",
        "type": "STRICT_DNS",
        "load_assignment": {
            "cluster_name": name,
            "endpoints": [{
                "lb_endpoints": [{
                    "endpoint": {
                        "address": {
                            "socket_address": {"address": host, "port_value": port}
                        }
                    }
                }]
            }]
        }
    })
}

/// Cluster pointing at a host that does not resolve
pub fn unreachable_cluster(name: &str) -> serde_json::Value {
    backend_cluster(name, "invalid.service", 8080)
}

/// Valid-looking listener update the proxy itself rejects
///
/// Envoy refuses in-place socket_options changes on a live listener, so
/// applying this to a running config forces the self-healing rollback path.
pub fn rejected_listener_update(cluster: &str) -> String {
    format!(
        r#"
name: http
enable_reuse_port: false
address:
    socket_address:
      address: 0.0.0.0
      port_value: 5000
socket_options:
  - description: "support tcp keep alive"
    state: 0
    level: 1
    name: 9
    int_value: 1
filter_chains:
    - filters:
        - name: envoy.http_connection_manager
          typed_config:
            "@type": type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager
            stat_prefix: local
            use_remote_address: true
            route_config:
              name: local_route
              virtual_hosts:
              - name: local_service
                domains: ['*']
                routes:
                - {{ match: {{ prefix: "/" }}, route: {{ cluster: "{cluster}" }} }}
            http_filters:
                - name: envoy.filters.http.router
                  typed_config:
                    "@type": type.googleapis.com/envoy.extensions.filters.http.router.v3.Router
"#
    )
}

/// Listener the validating webhook denies at admission time
pub fn malformed_listener() -> String {
    r#"
name: http
enable_reuse_port: false
address: MISSING
"#
    .to_string()
}

// =============================================================================
// Config mutation helpers for the update scenarios
// =============================================================================

/// Replace every listener of a config, whichever encoding it carries
pub fn replace_listeners(config: &mut EnvoyConfig, doc: &str) {
    if let Some(resources) = config.spec.envoy_resources.as_mut() {
        resources.listeners = vec![EnvoyResourceValue {
            name: Some("http".to_string()),
            value: doc.to_string(),
        }];
    }
    if let Some(resources) = config.spec.resources.as_mut() {
        let value: serde_json::Value = serde_yaml::from_str(doc).expect("valid listener document");
        for resource in resources
            .iter_mut()
            .filter(|resource| resource.type_ == ResourceType::Listener)
        {
            resource.value = Some(value.clone());
        }
    }
}

/// Replace every cluster of a config, whichever encoding it carries
pub fn replace_clusters(config: &mut EnvoyConfig, cluster: &serde_json::Value) {
    if let Some(resources) = config.spec.envoy_resources.as_mut() {
        let doc = serde_yaml::to_string(cluster).expect("serializable cluster document");
        resources.clusters = vec![EnvoyResourceValue {
            name: None,
            value: doc,
        }];
    }
    if let Some(resources) = config.spec.resources.as_mut() {
        for resource in resources
            .iter_mut()
            .filter(|resource| resource.type_ == ResourceType::Cluster)
        {
            resource.value = Some(cluster.clone());
        }
    }
}

// =============================================================================
// Fleet scenario setup
// =============================================================================

/// Which workload variant a scenario exercises
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variant {
    Standalone,
    Sidecar,
}

/// Everything one proxy scenario owns on the cluster
pub struct FleetScenario {
    pub ns: TestNamespace,
    pub client: Client,
    pub backend: HttpbinBackend,
    pub discovery: Managed<DiscoveryService>,
    pub config: Managed<EnvoyConfig>,
    pub fleet: EnvoyFleet,
}

impl FleetScenario {
    /// Commit discovery service, backend, config and fleet in order
    ///
    /// `sections_for` receives the committed backend so clusters can point at
    /// its in-cluster endpoint.
    pub async fn deploy<F>(
        prefix: &str,
        encoding: Encoding,
        variant: Variant,
        options: FleetOptions,
        sections_for: F,
    ) -> Self
    where
        F: FnOnce(&HttpbinBackend) -> ConfigSections,
    {
        let cluster = init_test().await;
        let client = cluster.new_client().await.expect("create client");
        let settings = Settings::from_env();

        let ns = TestNamespace::create(client.clone(), prefix)
            .await
            .expect("create namespace");

        let mut discovery_manifest = DiscoveryService::new(
            &unique_name("discovery"),
            DiscoveryServiceSpec::default(),
        );
        discovery_manifest.metadata.namespace = Some(ns.name().to_string());
        let mut discovery = Managed::new(client.clone(), ns.name(), discovery_manifest);
        discovery.commit().await.expect("commit discovery service");

        let mut backend = HttpbinBackend::new(
            client.clone(),
            ns.name(),
            &unique_name("httpbin"),
            &settings.backend_image,
            None,
        );
        backend.commit().await.expect("commit backend");

        let sections = sections_for(&backend);
        let config_manifest = build_config(
            &unique_name("config"),
            ns.name(),
            encoding,
            &sections,
            None,
        )
        .expect("build config");
        let mut config = Managed::new(client.clone(), ns.name(), config_manifest);
        config.commit().await.expect("commit config");

        let fleet = match variant {
            Variant::Standalone => EnvoyFleet::standalone(
                client.clone(),
                ns.name(),
                &unique_name("envoy"),
                &discovery.name(),
                config.manifest(),
                &settings.envoy_image,
                options,
            ),
            Variant::Sidecar => EnvoyFleet::sidecar(
                client.clone(),
                ns.name(),
                &unique_name("envoy"),
                config.manifest(),
                backend.deployment_name(),
                &settings.envoy_image,
                options,
            ),
        }
        .expect("construct fleet");

        let mut scenario = Self {
            ns,
            client,
            backend,
            discovery,
            config,
            fleet,
        };
        scenario.fleet.commit().await.expect("commit fleet");
        scenario
    }

    /// Api handle for the scenario's EnvoyConfig
    pub fn config_api(&self) -> Api<EnvoyConfig> {
        Api::namespaced(self.client.clone(), self.ns.name())
    }

    /// Best-effort teardown in reverse commit order
    ///
    /// Runs every step regardless of earlier failures so a broken scenario
    /// still releases its cluster resources.
    pub async fn teardown(mut self) {
        if let Err(err) = self.fleet.delete().await {
            tracing::warn!(error = %err, "fleet teardown failed");
        }
        if let Err(err) = self.config.delete().await {
            tracing::warn!(error = %err, "config teardown failed");
        }
        if let Err(err) = self.backend.delete().await {
            tracing::warn!(error = %err, "backend teardown failed");
        }
        if let Err(err) = self.discovery.delete().await {
            tracing::warn!(error = %err, "discovery service teardown failed");
        }
        if let Err(err) = self.ns.cleanup().await {
            tracing::warn!(error = %err, "namespace cleanup failed");
        }
    }
}
