//! Environment-derived test settings

/// Images and cluster facts the scenarios need
#[derive(Clone, Debug)]
pub struct Settings {
    /// Envoy image for EnvoyDeployments and sidecar injection
    pub envoy_image: String,
    /// Image of the httpbin echo backend
    pub backend_image: String,
    /// Application domain of the cluster's router, e.g. `apps.example.com`
    pub apps_domain: Option<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            envoy_image: env_or("MARIN3R_E2E_ENVOY_IMAGE", "envoyproxy/envoy:v1.25.1"),
            backend_image: env_or("MARIN3R_E2E_BACKEND_IMAGE", "kennethreitz/httpbin"),
            apps_domain: std::env::var("MARIN3R_E2E_APPS_DOMAIN").ok(),
        }
    }

    /// Wildcard covering every route hostname the router assigns
    pub fn wildcard_domain(&self) -> Option<String> {
        self.apps_domain.as_ref().map(|domain| format!("*.{domain}"))
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
