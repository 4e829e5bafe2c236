mod discovery_service;
mod envoy_config;
mod route;

pub use discovery_service::*;
pub use envoy_config::*;
pub use route::*;
