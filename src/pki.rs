//! Certificate hierarchy builder for TLS trust-chain scenarios
//!
//! A [`CertInfo`] tree declares an issuance hierarchy by node name; building
//! it yields a flat name-to-certificate map so scenarios can reference any
//! node ("envoy_ca", "valid_cert", "invalid_ca", ...) independently. Every
//! non-root certificate is signed by its parent's key, and sibling subtrees
//! never share issuance, so a leaf from one subtree must fail verification
//! against any other subtree's authority.
//!
//! Issuance goes through the [`CertificateSigner`] capability; [`LocalSigner`]
//! implements it in-process, keeping the signing state explicit instead of
//! hidden in a shared service.

use std::collections::BTreeMap;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;

#[derive(Error, Debug)]
pub enum PkiError {
    #[error("certificate issuance failed: {0}")]
    Issuance(#[from] rcgen::Error),

    #[error("certificate parsing failed: {0}")]
    Parse(String),

    #[error("duplicate node name in certificate tree: {0}")]
    DuplicateName(String),
}

/// Issued certificate material, PEM encoded
#[derive(Clone, Debug)]
pub struct Certificate {
    pub certificate: String,
    pub key: String,
}

/// Subject attribute set placed on an issued certificate
#[derive(Clone, Debug, Default)]
pub struct SubjectAttributes {
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
}

/// One node of a certificate issuance hierarchy
///
/// A node with children is issued as an authority; a node without children
/// (or mapped to `None` in its parent's children) is a leaf. `names` carries
/// explicit subject attribute sets for leaves.
#[derive(Clone, Debug, Default)]
pub struct CertInfo {
    pub names: Vec<SubjectAttributes>,
    pub children: BTreeMap<String, Option<CertInfo>>,
}

impl CertInfo {
    /// Leaf node carrying explicit subject attributes
    pub fn with_names(names: Vec<SubjectAttributes>) -> Self {
        Self {
            names,
            children: BTreeMap::new(),
        }
    }

    /// Interior node issuing the given children
    pub fn with_children(children: BTreeMap<String, Option<CertInfo>>) -> Self {
        Self {
            names: Vec::new(),
            children,
        }
    }
}

/// What kind of certificate an issuance request produces
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertKind {
    /// A signing authority (self-signed when it has no issuer)
    Authority,
    /// An end-entity certificate for TLS peers
    EndEntity,
}

/// A single issuance request handed to the signer
pub struct IssueRequest<'a> {
    pub common_name: &'a str,
    pub hosts: &'a [String],
    pub names: &'a [SubjectAttributes],
    pub kind: CertKind,
}

/// Certificate-signing capability
///
/// `issuer` is the parent certificate whose key signs the result; `None`
/// self-signs (roots).
pub trait CertificateSigner {
    fn issue(
        &self,
        request: &IssueRequest<'_>,
        issuer: Option<&Certificate>,
    ) -> Result<Certificate, PkiError>;
}

/// In-process signer backed by rcgen
pub struct LocalSigner;

impl CertificateSigner for LocalSigner {
    fn issue(
        &self,
        request: &IssueRequest<'_>,
        issuer: Option<&Certificate>,
    ) -> Result<Certificate, PkiError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(request.common_name.to_string()),
        );
        for attributes in request.names {
            push_subject_attributes(&mut dn, attributes);
        }
        params.distinguished_name = dn;

        match request.kind {
            CertKind::Authority => {
                params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
                params.key_usages = vec![
                    KeyUsagePurpose::KeyCertSign,
                    KeyUsagePurpose::CrlSign,
                    KeyUsagePurpose::DigitalSignature,
                ];
            }
            CertKind::EndEntity => {
                params.is_ca = IsCa::NoCa;
                params.key_usages = vec![
                    KeyUsagePurpose::DigitalSignature,
                    KeyUsagePurpose::KeyEncipherment,
                ];
                params.extended_key_usages = vec![
                    rcgen::ExtendedKeyUsagePurpose::ServerAuth,
                    rcgen::ExtendedKeyUsagePurpose::ClientAuth,
                ];
            }
        }

        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + ::time::Duration::days(365);

        params.subject_alt_names = request
            .hosts
            .iter()
            .map(|host| {
                if let Ok(ip) = host.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(host.clone())
                        .map(SanType::DnsName)
                        .map_err(|err| PkiError::Parse(format!("invalid DNS name '{host}': {err}")))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let key = KeyPair::generate()?;
        let certificate = match issuer {
            None => params.self_signed(&key)?,
            Some(parent) => {
                let parent_key = KeyPair::from_pem(&parent.key)?;
                let parent_issuer = Issuer::from_ca_cert_pem(&parent.certificate, &parent_key)
                    .map_err(|err| PkiError::Parse(format!("invalid issuer material: {err}")))?;
                params.signed_by(&key, &parent_issuer)?
            }
        };

        Ok(Certificate {
            certificate: certificate.pem(),
            key: key.serialize_pem(),
        })
    }
}

fn push_subject_attributes(dn: &mut DistinguishedName, attributes: &SubjectAttributes) {
    let fields = [
        (DnType::CountryName, &attributes.country),
        (DnType::StateOrProvinceName, &attributes.state),
        (DnType::LocalityName, &attributes.locality),
        (DnType::OrganizationName, &attributes.organization),
        (
            DnType::OrganizationalUnitName,
            &attributes.organizational_unit,
        ),
    ];
    for (dn_type, value) in fields {
        if let Some(value) = value {
            dn.push(dn_type, DnValue::Utf8String(value.clone()));
        }
    }
}

/// Issue every node of a certificate tree and return a flat name map
///
/// Top-level nodes become self-signed authorities; every other node is
/// signed by its parent. `hosts` is stamped as subject alternative names on
/// every issued certificate (typically a cluster wildcard domain).
pub fn build_hierarchy(
    signer: &dyn CertificateSigner,
    tree: &BTreeMap<String, CertInfo>,
    hosts: &[String],
) -> Result<BTreeMap<String, Certificate>, PkiError> {
    let mut issued = BTreeMap::new();
    for (name, info) in tree {
        let root = signer.issue(
            &IssueRequest {
                common_name: name,
                hosts,
                names: &info.names,
                kind: CertKind::Authority,
            },
            None,
        )?;
        issue_children(signer, &info.children, &root, hosts, &mut issued)?;
        insert_unique(&mut issued, name, root)?;
    }
    Ok(issued)
}

fn issue_children(
    signer: &dyn CertificateSigner,
    children: &BTreeMap<String, Option<CertInfo>>,
    parent: &Certificate,
    hosts: &[String],
    issued: &mut BTreeMap<String, Certificate>,
) -> Result<(), PkiError> {
    for (name, child) in children {
        let empty = CertInfo::default();
        let info = child.as_ref().unwrap_or(&empty);
        let kind = if info.children.is_empty() {
            CertKind::EndEntity
        } else {
            CertKind::Authority
        };
        let certificate = signer.issue(
            &IssueRequest {
                common_name: name,
                hosts,
                names: &info.names,
                kind,
            },
            Some(parent),
        )?;
        issue_children(signer, &info.children, &certificate, hosts, issued)?;
        insert_unique(issued, name, certificate)?;
    }
    Ok(())
}

fn insert_unique(
    issued: &mut BTreeMap<String, Certificate>,
    name: &str,
    certificate: Certificate,
) -> Result<(), PkiError> {
    if issued.insert(name.to_string(), certificate).is_some() {
        return Err(PkiError::DuplicateName(name.to_string()));
    }
    Ok(())
}

/// Whether `certificate` was signed by `authority`'s key
pub fn verify_signed_by(certificate: &Certificate, authority: &Certificate) -> Result<bool, PkiError> {
    let cert_der = pem_contents(&certificate.certificate)?;
    let authority_der = pem_contents(&authority.certificate)?;

    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|err| PkiError::Parse(format!("invalid certificate: {err}")))?;
    let (_, authority) = X509Certificate::from_der(&authority_der)
        .map_err(|err| PkiError::Parse(format!("invalid authority certificate: {err}")))?;

    Ok(cert.verify_signature(Some(authority.public_key())).is_ok())
}

fn pem_contents(pem_text: &str) -> Result<Vec<u8>, PkiError> {
    let parsed = ::pem::parse(pem_text.as_bytes())
        .map_err(|err| PkiError::Parse(format!("invalid PEM: {err}")))?;
    Ok(parsed.contents().to_vec())
}
