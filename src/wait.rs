//! Bounded polling for asynchronously reconciled status
//!
//! The control plane rewrites resource status out-of-band, so every read here
//! is a possibly-stale snapshot. [`poll_until`] keeps fetching snapshots until
//! a predicate accepts one or the deadline passes; it yields between attempts
//! and returns cleanly even when the resource never records any status at all
//! (e.g. a manifest rejected at admission before status was ever written).
//!
//! The clock is injected so the loop can be driven by a fake in unit tests.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::time::Instant;

use crate::crd::{CacheState, EnvoyConfig, Route};

/// Default deadline for workload readiness
pub const READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Default deadline for cache-state transitions
pub const CACHE_STATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default deadline for route admission
pub const ROUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between poll attempts
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Time source and sleeper used by the poll loop
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// The tokio wall clock
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Poll `fetch` until `predicate` accepts an observation or `timeout` elapses
///
/// Returns the first accepted observation, or `None` on timeout. A `None`
/// from `fetch` counts as "nothing observed yet" and the loop continues.
/// The caller decides whether a timeout is a test failure.
pub async fn poll_until<T, F, Fut, P>(
    clock: &dyn Clock,
    timeout: Duration,
    interval: Duration,
    mut fetch: F,
    predicate: P,
) -> Option<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Option<T>> + Send,
    P: Fn(&T) -> bool + Send + Sync,
    T: Send,
{
    let deadline = clock.now() + timeout;
    loop {
        if let Some(observed) = fetch().await {
            if predicate(&observed) {
                return Some(observed);
            }
        }
        if clock.now() >= deadline {
            return None;
        }
        clock.sleep(interval).await;
    }
}

/// Predicate: the config's cache state equals `expected`
pub fn cache_state_is(expected: CacheState) -> impl Fn(&EnvoyConfig) -> bool {
    move |config| {
        config
            .status
            .as_ref()
            .and_then(|status| status.cache_state)
            .map(|state| state == expected)
            .unwrap_or(false)
    }
}

/// Predicate: the deployment's status carries `readyReplicas`
///
/// Presence of the field is the readiness signal; it is absent until the
/// first replica reports ready.
pub fn deployment_ready(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .is_some()
}

/// Wait until a config reaches the expected cache state
pub async fn wait_for_cache_state(
    api: &Api<EnvoyConfig>,
    name: &str,
    expected: CacheState,
    timeout: Duration,
) -> bool {
    let api = api.clone();
    let name = name.to_string();
    poll_until(
        &TokioClock,
        timeout,
        POLL_INTERVAL,
        move || {
            let api = api.clone();
            let name = name.clone();
            async move { fetch_snapshot(&api, &name).await }
        },
        cache_state_is(expected),
    )
    .await
    .is_some()
}

/// Wait until a single deployment reports ready replicas
pub async fn wait_for_deployment_ready(
    api: &Api<Deployment>,
    name: &str,
    timeout: Duration,
) -> bool {
    let api = api.clone();
    let name = name.to_string();
    poll_until(
        &TokioClock,
        timeout,
        POLL_INTERVAL,
        move || {
            let api = api.clone();
            let name = name.clone();
            async move { fetch_snapshot(&api, &name).await }
        },
        deployment_ready,
    )
    .await
    .is_some()
}

/// Wait until every deployment of a proxy instance reports ready replicas
///
/// Deployments are selected by the `app.kubernetes.io/instance` label; the
/// wait only succeeds once at least one deployment matches and all matches
/// are ready.
pub async fn wait_for_instance_ready(
    client: Client,
    namespace: &str,
    instance: &str,
    timeout: Duration,
) -> bool {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    let params = ListParams::default()
        .labels(&format!("app.kubernetes.io/instance={instance}"));
    poll_until(
        &TokioClock,
        timeout,
        POLL_INTERVAL,
        move || {
            let api = api.clone();
            let params = params.clone();
            async move {
                match api.list(&params).await {
                    Ok(list) => Some(list.items),
                    Err(err) => {
                        tracing::debug!(error = %err, "deployment list failed, retrying");
                        None
                    }
                }
            }
        },
        |deployments: &Vec<Deployment>| {
            !deployments.is_empty() && deployments.iter().all(deployment_ready)
        },
    )
    .await
    .is_some()
}

/// Wait until a route is admitted, returning its assigned hostname
pub async fn wait_for_route_admitted(
    api: &Api<Route>,
    name: &str,
    timeout: Duration,
) -> Option<String> {
    let api = api.clone();
    let name = name.to_string();
    poll_until(
        &TokioClock,
        timeout,
        POLL_INTERVAL,
        move || {
            let api = api.clone();
            let name = name.clone();
            async move { fetch_snapshot(&api, &name).await }
        },
        |route: &Route| route.admitted_host().is_some(),
    )
    .await
    .and_then(|route| route.admitted_host().map(str::to_string))
}

/// Wait until a resource is gone from the server
pub async fn wait_for_deletion<T>(api: &Api<T>, name: &str, timeout: Duration) -> bool
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + 'static,
    <T as kube::Resource>::DynamicType: Default,
{
    let api = api.clone();
    let name = name.to_string();
    poll_until(
        &TokioClock,
        timeout,
        POLL_INTERVAL,
        move || {
            let api = api.clone();
            let name = name.clone();
            async move {
                match api.get_opt(&name).await {
                    Ok(current) => Some(current.is_none()),
                    Err(err) => {
                        tracing::debug!(error = %err, "existence check failed, retrying");
                        None
                    }
                }
            }
        },
        |gone: &bool| *gone,
    )
    .await
    .is_some()
}

async fn fetch_snapshot<T>(api: &Api<T>, name: &str) -> Option<T>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    match api.get_opt(name).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::debug!(error = %err, "status fetch failed, retrying");
            None
        }
    }
}
