//! Lifecycle contract for remotely managed resources
//!
//! Everything this harness owns on the cluster goes through `commit` /
//! `delete`: commit creates the object and blocks until its type-specific
//! readiness condition holds, delete removes it and treats an already-absent
//! object as success so teardown paths can run unconditionally.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{resource} did not become ready within {timeout:?}")]
    ReadinessTimeout { resource: String, timeout: Duration },
}

/// Any entity whose lifecycle is controlled by `commit` and `delete`
///
/// `commit` performs exactly one creation and, for reconciled entity types,
/// blocks until the entity's readiness condition holds. `delete` removes the
/// entity and is idempotent against double-deletion or external deletion.
#[async_trait]
pub trait Lifecycle {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn commit(&mut self) -> Result<(), Self::Error>;

    async fn delete(&mut self) -> Result<(), Self::Error>;
}

/// A single remote object tracked alongside its committed state
///
/// The handle owns the manifest; after a successful commit the manifest is
/// replaced by the server-accepted representation (the server may add or
/// reject fields).
pub struct Managed<T> {
    api: Api<T>,
    manifest: T,
    committed: bool,
}

impl<T> Managed<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug,
    <T as Resource>::DynamicType: Default,
{
    pub fn new(client: Client, namespace: &str, manifest: T) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            manifest,
            committed: false,
        }
    }

    pub fn name(&self) -> String {
        self.manifest.name_any()
    }

    pub fn manifest(&self) -> &T {
        &self.manifest
    }

    pub fn committed(&self) -> bool {
        self.committed
    }

    /// Create the object on the server and return the accepted representation
    pub async fn commit(&mut self) -> Result<T, LifecycleError> {
        let accepted = self.api.create(&PostParams::default(), &self.manifest).await?;
        tracing::debug!(name = %accepted.name_any(), "created resource");
        self.manifest = accepted.clone();
        self.committed = true;
        Ok(accepted)
    }

    /// Delete the object, ignoring a missing remote counterpart
    pub async fn delete(&mut self) -> Result<(), LifecycleError> {
        delete_ignore_missing(&self.api, &self.name()).await?;
        self.committed = false;
        Ok(())
    }
}

/// Delete a namespaced resource, absorbing "not found"
pub async fn delete_ignore_missing<T>(api: &Api<T>, name: &str) -> Result<(), kube::Error>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            tracing::debug!(name, "deleted resource");
            Ok(())
        }
        Err(kube::Error::Api(ref response)) if response.code == 404 => {
            tracing::debug!(name, "resource already absent");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
