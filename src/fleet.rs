//! Composite Envoy fleet orchestration
//!
//! An [`EnvoyFleet`] is one managed proxy plus its network exposure: the
//! Envoy workload (a dedicated EnvoyDeployment, or a sidecar injected into an
//! existing workload), a Service selecting it and a Route exposing it. The
//! discovery service and the EnvoyConfig are committed by the caller before
//! the fleet; the fleet derives its port list from the config's listeners.
//!
//! Commit order is fixed: workload, wait for readiness, service, route.
//! Teardown runs in reverse and is best-effort per resource: an already
//! absent dependent never blocks deletion of the rest, and no automatic
//! rollback happens when commit fails partway (the caller's teardown path
//! owns the partial state).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::core::ObjectMeta;
use kube::{Client, ResourceExt};
use thiserror::Error;

use crate::apply::{modify_and_apply, ApplyOutcome};
use crate::config::{self, ConfigError};
use crate::crd::{
    EnvoyConfig, EnvoyDeployment, EnvoyDeploymentSpec, EnvoyPort, ReplicasSpec, Route, RoutePort,
    RouteSpec, RouteTarget, RouteTls, TlsTermination,
};
use crate::http::{BackoffClient, ProbeError};
use crate::lifecycle::{delete_ignore_missing, Lifecycle};
use crate::pki::Certificate;
use crate::wait;

/// Pod-template annotation naming the Envoy node ID
pub const NODE_ID_ANNOTATION: &str = "marin3r.3scale.net/node-id";
/// Pod-template annotation selecting the injected Envoy image
pub const ENVOY_IMAGE_ANNOTATION: &str = "marin3r.3scale.net/envoy-image";
/// Pod-template annotation mapping listener names to ports
pub const PORTS_ANNOTATION: &str = "marin3r.3scale.net/ports";
/// Pod-template label that turns sidecar injection on
pub const SIDECAR_STATUS_LABEL: &str = "marin3r.3scale.net/status";
/// Label tying generated workloads, services and routes to one fleet
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid proxy config: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("proxy workload {0} did not become ready in time")]
    WorkloadNotReady(String),

    #[error("sidecar injection into {workload} was not applied: {response}")]
    InjectionConflict {
        workload: String,
        response: kube::core::ErrorResponse,
    },

    #[error("route {0} was never admitted by the router")]
    RouteNotAdmitted(String),
}

/// Tunable deadlines and metadata of a fleet instance
#[derive(Clone, Debug)]
pub struct FleetOptions {
    /// Terminate the route with TLS passthrough and probe over https
    pub tls: bool,
    /// Labels stamped on every resource the fleet creates
    pub labels: Option<BTreeMap<String, String>>,
    /// Deadline for the Envoy workload to become ready after commit
    pub ready_timeout: Duration,
    /// Deadline for the route to be admitted after creation
    pub route_timeout: Duration,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            tls: false,
            labels: None,
            ready_timeout: wait::READY_TIMEOUT,
            route_timeout: wait::ROUTE_TIMEOUT,
        }
    }
}

/// How the Envoy containers of a fleet are brought up and torn down
///
/// Selected at fleet construction; the service and route handling is shared
/// by all strategies.
#[async_trait]
pub trait ProxyWorkload: Send + Sync {
    /// Bring the Envoy containers up and wait until they are ready
    async fn roll_out(&mut self) -> Result<(), FleetError>;

    /// Best-effort removal of whatever `roll_out` put in place
    async fn tear_down(&mut self) -> Result<(), FleetError>;
}

/// Dedicated EnvoyDeployment referencing the discovery service and config
pub struct EnvoyDeploymentWorkload {
    client: Client,
    namespace: String,
    name: String,
    discovery_service: String,
    config_name: String,
    ports: BTreeMap<String, i32>,
    image: String,
    labels: Option<BTreeMap<String, String>>,
    ready_timeout: Duration,
}

#[async_trait]
impl ProxyWorkload for EnvoyDeploymentWorkload {
    async fn roll_out(&mut self) -> Result<(), FleetError> {
        let mut manifest = EnvoyDeployment::new(
            &self.name,
            EnvoyDeploymentSpec {
                discovery_service_ref: self.discovery_service.clone(),
                envoy_config_ref: self.config_name.clone(),
                ports: self
                    .ports
                    .iter()
                    .map(|(name, port)| EnvoyPort {
                        name: name.clone(),
                        port: *port,
                    })
                    .collect(),
                image: Some(self.image.clone()),
                replicas: Some(ReplicasSpec { static_: Some(1) }),
            },
        );
        manifest.metadata.namespace = Some(self.namespace.clone());
        manifest.metadata.labels = self.labels.clone();

        let api: Api<EnvoyDeployment> = Api::namespaced(self.client.clone(), &self.namespace);
        api.create(&Default::default(), &manifest).await?;
        tracing::info!(name = %self.name, "created EnvoyDeployment");

        let ready = wait::wait_for_instance_ready(
            self.client.clone(),
            &self.namespace,
            &self.name,
            self.ready_timeout,
        )
        .await;
        if !ready {
            return Err(FleetError::WorkloadNotReady(self.name.clone()));
        }
        Ok(())
    }

    async fn tear_down(&mut self) -> Result<(), FleetError> {
        let api: Api<EnvoyDeployment> = Api::namespaced(self.client.clone(), &self.namespace);
        delete_ignore_missing(&api, &self.name).await?;
        Ok(())
    }
}

/// Sidecar injection into an existing workload's pod template
pub struct SidecarInjection {
    client: Client,
    namespace: String,
    instance: String,
    workload: String,
    config_name: String,
    ports: BTreeMap<String, i32>,
    image: String,
    ready_timeout: Duration,
}

/// The `name:port` pairs published through the ports annotation
fn ports_annotation(ports: &BTreeMap<String, i32>) -> String {
    ports
        .iter()
        .map(|(name, port)| format!("{name}:{port}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ProxyWorkload for SidecarInjection {
    async fn roll_out(&mut self) -> Result<(), FleetError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);

        let node_id = self.config_name.clone();
        let image = self.image.clone();
        let ports = ports_annotation(&self.ports);
        let instance = self.instance.clone();
        let outcome = modify_and_apply(&api, &self.workload, move |deployment| {
            let Some(spec) = deployment.spec.as_mut() else {
                return;
            };
            let meta = spec.template.metadata.get_or_insert_with(Default::default);
            let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
            annotations.insert(NODE_ID_ANNOTATION.to_string(), node_id);
            annotations.insert(ENVOY_IMAGE_ANNOTATION.to_string(), image);
            annotations.insert(PORTS_ANNOTATION.to_string(), ports);
            let labels = meta.labels.get_or_insert_with(BTreeMap::new);
            labels.insert(SIDECAR_STATUS_LABEL.to_string(), "enabled".to_string());
            labels.insert(INSTANCE_LABEL.to_string(), instance);
        })
        .await?;

        if let ApplyOutcome::Conflict(response) = outcome {
            return Err(FleetError::InjectionConflict {
                workload: self.workload.clone(),
                response,
            });
        }
        tracing::info!(workload = %self.workload, "injected sidecar into pod template");

        let ready = wait::wait_for_deployment_ready(&api, &self.workload, self.ready_timeout).await;
        if !ready {
            return Err(FleetError::WorkloadNotReady(self.workload.clone()));
        }
        Ok(())
    }

    async fn tear_down(&mut self) -> Result<(), FleetError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);

        let result = modify_and_apply(&api, &self.workload, |deployment| {
            let Some(spec) = deployment.spec.as_mut() else {
                return;
            };
            let Some(meta) = spec.template.metadata.as_mut() else {
                return;
            };
            if let Some(annotations) = meta.annotations.as_mut() {
                annotations.remove(NODE_ID_ANNOTATION);
                annotations.remove(ENVOY_IMAGE_ANNOTATION);
                annotations.remove(PORTS_ANNOTATION);
            }
            if let Some(labels) = meta.labels.as_mut() {
                labels.remove(SIDECAR_STATUS_LABEL);
                labels.remove(INSTANCE_LABEL);
            }
        })
        .await;

        match result {
            Ok(outcome) => {
                if !outcome.succeeded() {
                    tracing::warn!(workload = %self.workload, "patch reversal hit a conflict");
                }
                Ok(())
            }
            Err(kube::Error::Api(ref response)) if response.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// One managed proxy instance plus its network exposure
pub struct EnvoyFleet {
    client: Client,
    namespace: String,
    name: String,
    ports: BTreeMap<String, i32>,
    tls: bool,
    labels: Option<BTreeMap<String, String>>,
    route_timeout: Duration,
    workload: Box<dyn ProxyWorkload>,
    service_committed: bool,
    route_committed: bool,
    hostname: Option<String>,
}

impl EnvoyFleet {
    /// Fleet backed by a dedicated EnvoyDeployment
    pub fn standalone(
        client: Client,
        namespace: &str,
        name: &str,
        discovery_service: &str,
        config: &EnvoyConfig,
        image: &str,
        options: FleetOptions,
    ) -> Result<Self, FleetError> {
        let ports = config::ports(config)?;
        let workload = EnvoyDeploymentWorkload {
            client: client.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            discovery_service: discovery_service.to_string(),
            config_name: config.name_any(),
            ports: ports.clone(),
            image: image.to_string(),
            labels: options.labels.clone(),
            ready_timeout: options.ready_timeout,
        };
        Ok(Self::assemble(client, namespace, name, ports, options, Box::new(workload)))
    }

    /// Fleet injected as a sidecar into an existing workload
    pub fn sidecar(
        client: Client,
        namespace: &str,
        name: &str,
        config: &EnvoyConfig,
        workload: &str,
        image: &str,
        options: FleetOptions,
    ) -> Result<Self, FleetError> {
        let ports = config::ports(config)?;
        let injection = SidecarInjection {
            client: client.clone(),
            namespace: namespace.to_string(),
            instance: name.to_string(),
            workload: workload.to_string(),
            config_name: config.name_any(),
            ports: ports.clone(),
            image: image.to_string(),
            ready_timeout: options.ready_timeout,
        };
        Ok(Self::assemble(client, namespace, name, ports, options, Box::new(injection)))
    }

    fn assemble(
        client: Client,
        namespace: &str,
        name: &str,
        ports: BTreeMap<String, i32>,
        options: FleetOptions,
        workload: Box<dyn ProxyWorkload>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
            ports,
            tls: options.tls,
            labels: options.labels,
            route_timeout: options.route_timeout,
            workload,
            service_committed: false,
            route_committed: false,
            hostname: None,
        }
    }

    /// Listener name to port, as derived from the config at construction
    pub fn ports(&self) -> &BTreeMap<String, i32> {
        &self.ports
    }

    /// Hostname of the admitted route, once committed
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Whether the fleet's service and route have both been committed
    pub fn exposed(&self) -> bool {
        self.service_committed && self.route_committed
    }

    /// HTTP probe client for the fleet's public route
    pub fn probe_client(&self) -> Result<BackoffClient, FleetError> {
        let hostname = self
            .hostname
            .as_ref()
            .ok_or_else(|| FleetError::RouteNotAdmitted(self.name.clone()))?;
        let scheme = if self.tls { "https" } else { "http" };
        Ok(BackoffClient::new(format!("{scheme}://{hostname}"))?)
    }

    /// Mutually-authenticated probe client for a TLS fleet
    ///
    /// `authority` verifies the proxy's serving certificate; `identity`, when
    /// given, is presented as the client certificate.
    pub fn tls_probe_client(
        &self,
        authority: &Certificate,
        identity: Option<&Certificate>,
    ) -> Result<BackoffClient, FleetError> {
        let hostname = self
            .hostname
            .as_ref()
            .ok_or_else(|| FleetError::RouteNotAdmitted(self.name.clone()))?;
        Ok(BackoffClient::with_tls(
            format!("https://{hostname}"),
            &authority.certificate,
            identity.map(|cert| format!("{}{}", cert.certificate, cert.key)),
        )?)
    }

    async fn commit_service(&mut self) -> Result<(), FleetError> {
        let manifest = proxy_service(
            &self.name,
            &self.namespace,
            &self.ports,
            self.labels.as_ref(),
        );
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        api.create(&Default::default(), &manifest).await?;
        self.service_committed = true;
        Ok(())
    }

    async fn commit_route(&mut self) -> Result<(), FleetError> {
        let manifest = proxy_route(
            &self.name,
            &self.namespace,
            &self.ports,
            self.tls,
            self.labels.as_ref(),
        );
        let api: Api<Route> = Api::namespaced(self.client.clone(), &self.namespace);
        api.create(&Default::default(), &manifest).await?;
        self.route_committed = true;

        self.hostname = wait::wait_for_route_admitted(&api, &self.name, self.route_timeout).await;
        if self.hostname.is_none() {
            return Err(FleetError::RouteNotAdmitted(self.name.clone()));
        }
        tracing::info!(name = %self.name, hostname = %self.hostname.as_deref().unwrap_or(""), "route admitted");
        Ok(())
    }
}

/// Service selecting a fleet's Envoy pods, one TCP port per listener
fn proxy_service(
    name: &str,
    namespace: &str,
    ports: &BTreeMap<String, i32>,
    labels: Option<&BTreeMap<String, String>>,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: labels.cloned(),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                INSTANCE_LABEL.to_string(),
                name.to_string(),
            )])),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: Some(port_name.clone()),
                        port: *port,
                        target_port: Some(IntOrString::Int(*port)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Route exposing a fleet's service on its first listener port
fn proxy_route(
    name: &str,
    namespace: &str,
    ports: &BTreeMap<String, i32>,
    tls: bool,
    labels: Option<&BTreeMap<String, String>>,
) -> Route {
    let target_port = ports
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| "http".to_string());
    let mut route = Route::new(
        name,
        RouteSpec {
            to: RouteTarget {
                kind: "Service".to_string(),
                name: name.to_string(),
            },
            port: Some(RoutePort { target_port }),
            tls: tls.then_some(RouteTls {
                termination: TlsTermination::Passthrough,
            }),
        },
    );
    route.metadata.namespace = Some(namespace.to_string());
    route.metadata.labels = labels.cloned();
    route
}

#[async_trait]
impl Lifecycle for EnvoyFleet {
    type Error = FleetError;

    async fn commit(&mut self) -> Result<(), FleetError> {
        self.workload.roll_out().await?;
        self.commit_service().await?;
        self.commit_route().await?;
        Ok(())
    }

    async fn delete(&mut self) -> Result<(), FleetError> {
        let mut first_failure: Option<FleetError> = None;

        let routes: Api<Route> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(err) = delete_ignore_missing(&routes, &self.name).await {
            tracing::warn!(name = %self.name, error = %err, "route deletion failed");
            first_failure.get_or_insert(err.into());
        }
        self.route_committed = false;
        self.hostname = None;

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Err(err) = delete_ignore_missing(&services, &self.name).await {
            tracing::warn!(name = %self.name, error = %err, "service deletion failed");
            first_failure.get_or_insert(err.into());
        }
        self.service_committed = false;

        if let Err(err) = self.workload.tear_down().await {
            tracing::warn!(name = %self.name, error = %err, "workload teardown failed");
            first_failure.get_or_insert(err);
        }

        match first_failure {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
