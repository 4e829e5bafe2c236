//! End-to-end verification harness for marin3r-managed Envoy fleets
//!
//! The crate assembles the cluster resources behind one proxy instance (a
//! DiscoveryService, a versioned EnvoyConfig, an Envoy workload, a Service
//! and a Route), commits them in dependency order with idempotent teardown,
//! polls asynchronously reconciled status until it reaches an expected value,
//! performs read-modify-write updates against resources the operator is
//! concurrently reconciling, and issues certificate trust hierarchies for
//! TLS scenarios. The scenarios themselves live in `tests/integration`.

pub mod apply;
pub mod backend;
pub mod config;
pub mod crd;
pub mod fleet;
pub mod http;
pub mod lifecycle;
pub mod pki;
pub mod secrets;
pub mod settings;
pub mod wait;

pub use apply::{modify_and_apply, ApplyOutcome};
pub use backend::HttpbinBackend;
pub use config::{build_config, ports, ConfigSections, Encoding, SectionValue, TlsSecretRef};
pub use crd::{CacheState, DiscoveryService, EnvoyConfig, EnvoyDeployment, Route};
pub use fleet::{EnvoyFleet, FleetError, FleetOptions};
pub use http::BackoffClient;
pub use lifecycle::{delete_ignore_missing, Lifecycle, LifecycleError, Managed};
pub use pki::{
    build_hierarchy, verify_signed_by, CertInfo, Certificate, CertificateSigner, LocalSigner,
    SubjectAttributes,
};
pub use secrets::tls_secret;
pub use settings::Settings;
pub use wait::{wait_for_cache_state, wait_for_deletion, Clock, TokioClock};
