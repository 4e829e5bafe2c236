//! httpbin echo backend used as the upstream of Envoy clusters
//!
//! Standalone fleets point a cluster at this workload's service; sidecar
//! fleets additionally use its Deployment as the injection target.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::core::ObjectMeta;
use kube::Client;

use crate::lifecycle::{delete_ignore_missing, Lifecycle, LifecycleError};
use crate::wait;

/// Service port the backend is reachable on inside the cluster
pub const BACKEND_PORT: i32 = 8080;

// the httpbin container serves plain HTTP on 80
const CONTAINER_PORT: i32 = 80;

/// In-cluster DNS name and port of a backend service
pub fn backend_endpoint(name: &str, namespace: &str) -> (String, i32) {
    (
        format!("{name}.{namespace}.svc.cluster.local"),
        BACKEND_PORT,
    )
}

fn backend_selector(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

fn backend_metadata(
    name: &str,
    namespace: &str,
    labels: Option<&BTreeMap<String, String>>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: labels.cloned(),
        ..Default::default()
    }
}

fn backend_deployment(
    name: &str,
    namespace: &str,
    image: &str,
    labels: Option<&BTreeMap<String, String>>,
) -> Deployment {
    // pod-template labels hold only the selector key so sidecar injection can
    // add its own labels without breaking the (immutable) selector
    Deployment {
        metadata: backend_metadata(name, namespace, labels),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(backend_selector(name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(backend_selector(name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "httpbin".to_string(),
                        image: Some(image.to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: CONTAINER_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn backend_service(
    name: &str,
    namespace: &str,
    labels: Option<&BTreeMap<String, String>>,
) -> Service {
    Service {
        metadata: backend_metadata(name, namespace, labels),
        spec: Some(ServiceSpec {
            selector: Some(backend_selector(name)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: BACKEND_PORT,
                target_port: Some(IntOrString::Int(CONTAINER_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// An httpbin Deployment plus its Service
pub struct HttpbinBackend {
    client: Client,
    namespace: String,
    name: String,
    image: String,
    labels: Option<BTreeMap<String, String>>,
    ready_timeout: Duration,
}

impl HttpbinBackend {
    pub fn new(
        client: Client,
        namespace: &str,
        name: &str,
        image: &str,
        labels: Option<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
            image: image.to_string(),
            labels,
            ready_timeout: wait::READY_TIMEOUT,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the Deployment, used as the sidecar injection target
    pub fn deployment_name(&self) -> &str {
        &self.name
    }

    /// In-cluster DNS name and port of the backend service
    pub fn endpoint(&self) -> (String, i32) {
        backend_endpoint(&self.name, &self.namespace)
    }
}

#[async_trait]
impl Lifecycle for HttpbinBackend {
    type Error = LifecycleError;

    async fn commit(&mut self) -> Result<(), LifecycleError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        deployments
            .create(
                &Default::default(),
                &backend_deployment(&self.name, &self.namespace, &self.image, self.labels.as_ref()),
            )
            .await?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        services
            .create(
                &Default::default(),
                &backend_service(&self.name, &self.namespace, self.labels.as_ref()),
            )
            .await?;

        let ready =
            wait::wait_for_deployment_ready(&deployments, &self.name, self.ready_timeout).await;
        if !ready {
            return Err(LifecycleError::ReadinessTimeout {
                resource: format!("backend deployment {}", self.name),
                timeout: self.ready_timeout,
            });
        }
        tracing::info!(name = %self.name, "backend ready");
        Ok(())
    }

    async fn delete(&mut self) -> Result<(), LifecycleError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        delete_ignore_missing(&services, &self.name).await?;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        delete_ignore_missing(&deployments, &self.name).await?;
        Ok(())
    }
}
