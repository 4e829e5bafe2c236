//! Builders for the two EnvoyConfig wire encodings
//!
//! One semantic description ([`ConfigSections`]) can be rendered into either
//! the legacy `envoyResources` encoding or the typed `resources` encoding;
//! [`Encoding`] selects the serializer at build time. The `ports` view is
//! always derived from the manifest's listener set, never stored.

use std::collections::BTreeMap;

use kube::core::ObjectMeta;
use thiserror::Error;

use crate::crd::{
    Blueprint, EnvoyConfig, EnvoyConfigSpec, EnvoyResourceValue, EnvoyResources, EnvoySecretRef,
    ResourceType, TypedResource,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to serialize section document: {0}")]
    Serialize(#[source] serde_yaml::Error),

    #[error("failed to parse section document: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("listener document is missing {0}")]
    MalformedListener(&'static str),
}

/// One entry of a config section
///
/// Entries arrive either as already-serialized YAML documents or as
/// structured values; both encodings accept either form.
#[derive(Clone, Debug)]
pub enum SectionValue {
    /// An already-serialized document
    Rendered(String),
    /// A structured document, serialized on demand
    Structured(serde_json::Value),
}

impl SectionValue {
    /// The entry as a serialized YAML document (legacy encoding form)
    fn to_yaml(&self) -> Result<String, ConfigError> {
        match self {
            SectionValue::Rendered(doc) => Ok(doc.clone()),
            SectionValue::Structured(value) => {
                serde_yaml::to_string(value).map_err(ConfigError::Serialize)
            }
        }
    }

    /// The entry as a structured document (typed encoding form)
    fn to_document(&self) -> Result<serde_json::Value, ConfigError> {
        match self {
            SectionValue::Rendered(doc) => serde_yaml::from_str(doc).map_err(ConfigError::Parse),
            SectionValue::Structured(value) => Ok(value.clone()),
        }
    }
}

impl From<&str> for SectionValue {
    fn from(doc: &str) -> Self {
        SectionValue::Rendered(doc.to_string())
    }
}

impl From<String> for SectionValue {
    fn from(doc: String) -> Self {
        SectionValue::Rendered(doc)
    }
}

impl From<serde_json::Value> for SectionValue {
    fn from(value: serde_json::Value) -> Self {
        SectionValue::Structured(value)
    }
}

/// Reference to a kubernetes.io/tls Secret consumed by the config
#[derive(Clone, Debug)]
pub struct TlsSecretRef {
    pub name: String,
    /// Whether the secret holds a CA used to validate peer certificates
    pub is_ca: bool,
}

impl TlsSecretRef {
    pub fn certificate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_ca: false,
        }
    }

    pub fn certificate_authority(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_ca: true,
        }
    }
}

/// Semantic content of an EnvoyConfig, independent of wire encoding
#[derive(Clone, Debug, Default)]
pub struct ConfigSections {
    pub listeners: Vec<SectionValue>,
    pub clusters: Vec<SectionValue>,
    pub endpoints: Vec<SectionValue>,
    pub runtimes: Vec<SectionValue>,
    pub routes: Vec<SectionValue>,
    pub scoped_routes: Vec<SectionValue>,
    pub secrets: Vec<TlsSecretRef>,
}

impl ConfigSections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(mut self, value: impl Into<SectionValue>) -> Self {
        self.listeners.push(value.into());
        self
    }

    pub fn cluster(mut self, value: impl Into<SectionValue>) -> Self {
        self.clusters.push(value.into());
        self
    }

    pub fn route(mut self, value: impl Into<SectionValue>) -> Self {
        self.routes.push(value.into());
        self
    }

    pub fn secret(mut self, secret: TlsSecretRef) -> Self {
        self.secrets.push(secret);
        self
    }
}

/// Wire encodings of an EnvoyConfig
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Legacy flat-list encoding under `spec.envoyResources`
    EnvoyResources,
    /// Typed-list encoding under `spec.resources`
    Resources,
}

/// Build an EnvoyConfig manifest from semantic sections
///
/// The config's `nodeID` equals its name. Labels are merged into metadata
/// only when provided; absent labels leave the metadata unlabeled.
pub fn build_config(
    name: &str,
    namespace: &str,
    encoding: Encoding,
    sections: &ConfigSections,
    labels: Option<&BTreeMap<String, String>>,
) -> Result<EnvoyConfig, ConfigError> {
    let spec = match encoding {
        Encoding::EnvoyResources => EnvoyConfigSpec {
            node_id: name.to_string(),
            serialization: "yaml".to_string(),
            envoy_resources: Some(EnvoyResources {
                clusters: rendered_section(&sections.clusters)?,
                endpoints: rendered_section(&sections.endpoints)?,
                runtimes: rendered_section(&sections.runtimes)?,
                routes: rendered_section(&sections.routes)?,
                scoped_routes: rendered_section(&sections.scoped_routes)?,
                listeners: rendered_section(&sections.listeners)?,
                // the legacy encoding only carries the secret name
                secrets: sections
                    .secrets
                    .iter()
                    .map(|secret| EnvoySecretRef {
                        name: secret.name.clone(),
                    })
                    .collect(),
            }),
            resources: None,
        },
        Encoding::Resources => EnvoyConfigSpec {
            node_id: name.to_string(),
            serialization: "yaml".to_string(),
            envoy_resources: None,
            resources: Some(typed_resources(sections)?),
        },
    };

    Ok(EnvoyConfig {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: labels.cloned(),
            ..Default::default()
        },
        spec,
        status: None,
    })
}

fn rendered_section(entries: &[SectionValue]) -> Result<Vec<EnvoyResourceValue>, ConfigError> {
    entries
        .iter()
        .map(|entry| {
            Ok(EnvoyResourceValue {
                name: None,
                value: entry.to_yaml()?,
            })
        })
        .collect()
}

fn typed_resources(sections: &ConfigSections) -> Result<Vec<TypedResource>, ConfigError> {
    let typed_sections = [
        (ResourceType::Cluster, &sections.clusters),
        (ResourceType::Endpoint, &sections.endpoints),
        (ResourceType::Runtime, &sections.runtimes),
        (ResourceType::Route, &sections.routes),
        (ResourceType::ScopedRoute, &sections.scoped_routes),
        (ResourceType::Listener, &sections.listeners),
    ];

    let mut resources = Vec::new();
    for (type_, entries) in typed_sections {
        for entry in entries {
            resources.push(TypedResource {
                type_,
                value: Some(entry.to_document()?),
                generate_from_tls_secret: None,
                blueprint: None,
            });
        }
    }
    for secret in &sections.secrets {
        resources.push(TypedResource {
            type_: ResourceType::Secret,
            value: None,
            generate_from_tls_secret: Some(secret.name.clone()),
            blueprint: secret.is_ca.then_some(Blueprint::ValidationContext),
        });
    }
    Ok(resources)
}

/// All listener documents carried by a config, in structured form
pub fn listeners(config: &EnvoyConfig) -> Result<Vec<serde_json::Value>, ConfigError> {
    if let Some(envoy_resources) = &config.spec.envoy_resources {
        return envoy_resources
            .listeners
            .iter()
            .map(|entry| serde_yaml::from_str(&entry.value).map_err(ConfigError::Parse))
            .collect();
    }
    Ok(config
        .spec
        .resources
        .iter()
        .flatten()
        .filter(|resource| resource.type_ == ResourceType::Listener)
        .filter_map(|resource| resource.value.clone())
        .collect())
}

/// Listener name to bound port, derived from the committed listener set
///
/// This scans whichever encoding the manifest carries; it reflects the
/// current listeners and is never cached.
pub fn ports(config: &EnvoyConfig) -> Result<BTreeMap<String, i32>, ConfigError> {
    let mut ports = BTreeMap::new();
    for listener in listeners(config)? {
        let name = listener["name"]
            .as_str()
            .ok_or(ConfigError::MalformedListener("name"))?;
        let port = listener["address"]["socket_address"]["port_value"]
            .as_i64()
            .ok_or(ConfigError::MalformedListener(
                "address.socket_address.port_value",
            ))?;
        ports.insert(name.to_string(), port as i32);
    }
    Ok(ports)
}
