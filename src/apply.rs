//! Read-modify-write updates against controller-managed resources
//!
//! The control plane may rewrite an object (status, and under some paths the
//! spec) while an update is in flight. The guard fetches the latest
//! server-side representation, applies the caller's mutation to the in-memory
//! copy and submits it with the fetched resourceVersion, so a concurrent
//! write surfaces as a conflict instead of silently clobbering the object.
//! Conflicts are reported, never retried; the caller decides whether to.

use std::fmt::Debug;

use kube::api::{Api, PostParams};
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Outcome of a single read-modify-write submission
#[derive(Debug)]
pub enum ApplyOutcome<T> {
    /// The update was accepted; carries the server-side representation
    Applied(T),
    /// The object changed between fetch and submit; carries the raw server
    /// response for diagnostics
    Conflict(ErrorResponse),
}

impl<T> ApplyOutcome<T> {
    pub fn succeeded(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }

    pub fn into_applied(self) -> Option<T> {
        match self {
            ApplyOutcome::Applied(applied) => Some(applied),
            ApplyOutcome::Conflict(_) => None,
        }
    }
}

/// Fetch the latest representation, mutate a copy of it and submit the update
///
/// Performs exactly one fetch and one submit. A stale-version rejection is
/// returned as [`ApplyOutcome::Conflict`]; any other server error propagates
/// unchanged.
pub async fn modify_and_apply<T, F>(
    api: &Api<T>,
    name: &str,
    mutate: F,
) -> Result<ApplyOutcome<T>, kube::Error>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug,
    <T as Resource>::DynamicType: Default,
    F: FnOnce(&mut T),
{
    let mut latest = api.get(name).await?;
    mutate(&mut latest);

    match api.replace(name, &PostParams::default(), &latest).await {
        Ok(updated) => {
            tracing::debug!(name = %updated.name_any(), "update accepted");
            Ok(ApplyOutcome::Applied(updated))
        }
        Err(kube::Error::Api(response)) if response.code == 409 => {
            tracing::debug!(name, "update rejected, object changed since fetch");
            Ok(ApplyOutcome::Conflict(response))
        }
        Err(err) => Err(err),
    }
}
