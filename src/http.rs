//! Data-plane HTTP probe with transient-failure retry
//!
//! Routes and freshly rolled-out proxies are eventually consistent, so the
//! probe retries a bounded number of times on 503s and on connection errors
//! before reporting a verdict. Scenarios that assert on a 503 (config applied
//! but backend unreachable) disable the retry with [`BackoffClient::no_retry`].

use std::collections::HashSet;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// HTTP client bound to one base URL, retrying transient responses
pub struct BackoffClient {
    inner: reqwest::Client,
    base_url: String,
    retry_statuses: HashSet<u16>,
    attempts: u32,
    backoff: Duration,
}

impl BackoffClient {
    /// Client for a plain-HTTP endpoint
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProbeError> {
        let inner = reqwest::Client::builder().build()?;
        Ok(Self::assemble(inner, base_url.into()))
    }

    /// Client for a TLS endpoint verified against a private authority
    ///
    /// `identity_pem`, when given, holds a certificate chain followed by its
    /// private key and is presented as the client identity.
    pub fn with_tls(
        base_url: impl Into<String>,
        authority_pem: &str,
        identity_pem: Option<String>,
    ) -> Result<Self, ProbeError> {
        let mut builder = reqwest::Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(authority_pem.as_bytes())?);
        if let Some(identity) = identity_pem {
            builder = builder.identity(reqwest::Identity::from_pem(identity.as_bytes())?);
        }
        Ok(Self::assemble(builder.build()?, base_url.into()))
    }

    fn assemble(inner: reqwest::Client, base_url: String) -> Self {
        Self {
            inner,
            base_url,
            retry_statuses: HashSet::from([StatusCode::SERVICE_UNAVAILABLE.as_u16()]),
            attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }

    /// Disable retries so transient status codes are reported as-is
    pub fn no_retry(mut self) -> Self {
        self.retry_statuses.clear();
        self.attempts = 1;
        self
    }

    /// GET a path under the base URL and return the final status code
    pub async fn get(&self, path: &str) -> Result<StatusCode, ProbeError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if attempt >= self.attempts || !self.retry_statuses.contains(&status.as_u16()) {
                        return Ok(status);
                    }
                    tracing::debug!(%status, attempt, "transient response, retrying");
                }
                Err(err) => {
                    if attempt >= self.attempts || !(err.is_connect() || err.is_timeout()) {
                        return Err(err.into());
                    }
                    tracing::debug!(error = %err, attempt, "endpoint not reachable yet, retrying");
                }
            }
            tokio::time::sleep(self.backoff).await;
        }
    }
}
