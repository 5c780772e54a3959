//! Kubernetes API client
//!
//! Wraps a `kube::Client` built from a resolved [`ConnectionConfig`].

use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use thiserror::Error;

use super::config::{ConfigSource, ConnectionConfig, CredentialResolver};

#[derive(Debug, Error)]
pub enum ClientConstructionError {
    #[error("Invalid connection config: {0}")]
    InvalidConfig(String),
    #[error("Failed to create client: {0}")]
    Build(#[from] kube::Error),
}

/// Kubernetes API client bound to one connection config.
///
/// Construction performs no network I/O; the API server is first contacted
/// when an exec session is upgraded.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    endpoint: String,
}

impl ApiClient {
    /// Validate the config and build a client from it
    pub fn new(config: ConnectionConfig) -> Result<Self, ClientConstructionError> {
        match config.endpoint_scheme() {
            Some("https") | Some("http") => {}
            Some(other) => {
                return Err(ClientConstructionError::InvalidConfig(format!(
                    "unsupported endpoint scheme {other:?}"
                )))
            }
            None => {
                return Err(ClientConstructionError::InvalidConfig(
                    "endpoint has no scheme".to_string(),
                ))
            }
        }
        if config.endpoint_host().map_or(true, str::is_empty) {
            return Err(ClientConstructionError::InvalidConfig(
                "endpoint has no host".to_string(),
            ));
        }

        install_crypto_provider();
        let endpoint = config.endpoint();
        let client = Client::try_from(config.into_inner())?;
        tracing::debug!("Created API client for {}", endpoint);

        Ok(Self { client, endpoint })
    }

    /// Resolve credentials and build a client in one step
    pub async fn from_resolver<P, F>(resolver: &CredentialResolver<P, F>) -> crate::Result<Self>
    where
        P: ConfigSource,
        F: ConfigSource,
    {
        let config = resolver.resolve().await?;
        Ok(Self::new(config)?)
    }

    /// API server URL this client talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Namespace used when a request names none
    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    /// Get the raw kube client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Pod API scoped to a namespace
    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// rustls needs a process-wide provider before the first TLS config is built
fn install_crypto_provider() {
    // Err only means a provider is already installed
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
