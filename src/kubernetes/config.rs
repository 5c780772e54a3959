//! Kubernetes credential resolution
//!
//! Produces a [`ConnectionConfig`] by trying in-cluster service account
//! discovery first and falling back to the user's kubeconfig file
//! (typically ~/.kube/config).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kube::config::{InClusterError, KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::Config;
use thiserror::Error;

use crate::config::AppConfig;

/// Failure of a single credential source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    InCluster(#[from] InClusterError),
    #[error("failed to load kubeconfig {path:?}: {source}")]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: KubeconfigError,
    },
    #[error("no kubeconfig found at {0:?}")]
    NotFound(PathBuf),
    #[error("home directory not found")]
    HomeDirNotFound,
}

/// Both credential sources failed.
///
/// Carries each cause so callers can tell which environment assumption
/// was wrong.
#[derive(Debug, Error)]
#[error(
    "InClusterConfig as well as BuildConfigFromFlags failed. \
     Error in InClusterConfig: {in_cluster}. Error in BuildConfigFromFlags: {kubeconfig}"
)]
pub struct CredentialResolutionError {
    pub in_cluster: SourceError,
    pub kubeconfig: SourceError,
}

/// Where a connection config came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    InCluster,
    Kubeconfig(PathBuf),
}

/// How the client will authenticate to the API server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Token,
    ClientCertificate,
    Plugin,
    Basic,
    Anonymous,
}

/// A resolved cluster connection: endpoint, auth material and TLS trust.
///
/// Immutable once resolved. Not `Clone`: it is moved into
/// [`ApiClient::new`](super::ApiClient::new) by the call that resolved it.
#[derive(Debug)]
pub struct ConnectionConfig {
    inner: Config,
    origin: ConfigOrigin,
}

impl ConnectionConfig {
    pub fn new(inner: Config, origin: ConfigOrigin) -> Self {
        Self { inner, origin }
    }

    pub fn origin(&self) -> &ConfigOrigin {
        &self.origin
    }

    /// API server URL
    pub fn endpoint(&self) -> String {
        self.inner.cluster_url.to_string()
    }

    pub(crate) fn endpoint_host(&self) -> Option<&str> {
        self.inner.cluster_url.host()
    }

    pub(crate) fn endpoint_scheme(&self) -> Option<&str> {
        self.inner.cluster_url.scheme_str()
    }

    pub fn default_namespace(&self) -> &str {
        &self.inner.default_namespace
    }

    pub fn auth_kind(&self) -> AuthKind {
        let auth = &self.inner.auth_info;
        if auth.token.is_some() || auth.token_file.is_some() {
            AuthKind::Token
        } else if auth.client_certificate.is_some() || auth.client_certificate_data.is_some() {
            AuthKind::ClientCertificate
        } else if auth.exec.is_some() || auth.auth_provider.is_some() {
            AuthKind::Plugin
        } else if auth.username.is_some() {
            AuthKind::Basic
        } else {
            AuthKind::Anonymous
        }
    }

    pub fn accepts_invalid_certs(&self) -> bool {
        self.inner.accept_invalid_certs
    }

    /// Whether a cluster CA bundle is pinned instead of the system roots
    pub fn has_custom_roots(&self) -> bool {
        self.inner.root_cert.as_ref().is_some_and(|roots| !roots.is_empty())
    }

    pub(crate) fn into_inner(self) -> Config {
        self.inner
    }
}

/// One way of obtaining cluster credentials
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<ConnectionConfig, SourceError>;
}

/// Service account credentials mounted into pods by the cluster
#[derive(Debug, Clone, Copy, Default)]
pub struct InClusterSource;

#[async_trait]
impl ConfigSource for InClusterSource {
    async fn load(&self) -> Result<ConnectionConfig, SourceError> {
        let config = Config::incluster()?;
        Ok(ConnectionConfig::new(config, ConfigOrigin::InCluster))
    }
}

/// Credentials from a kubeconfig file
#[derive(Debug, Clone, Default)]
pub struct KubeconfigSource {
    /// Explicit file; `None` means `<home>/.kube/config`
    path: Option<PathBuf>,
    /// Context to select; `None` uses the file's current-context
    context: Option<String>,
}

impl KubeconfigSource {
    /// Read a specific kubeconfig file
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            context: None,
        }
    }

    /// Read `<home>/.kube/config` for the given home directory
    pub fn in_home(home: &Path) -> Self {
        Self::at(home.join(".kube").join("config"))
    }

    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// The file this source reads
    pub fn path(&self) -> Result<PathBuf, SourceError> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => {
                let home = dirs::home_dir().ok_or(SourceError::HomeDirNotFound)?;
                Ok(home.join(".kube").join("config"))
            }
        }
    }
}

#[async_trait]
impl ConfigSource for KubeconfigSource {
    async fn load(&self) -> Result<ConnectionConfig, SourceError> {
        let path = self.path()?;
        if !path.exists() {
            return Err(SourceError::NotFound(path));
        }

        let kubeconfig = Kubeconfig::read_from(&path).map_err(|source| SourceError::Kubeconfig {
            path: path.clone(),
            source,
        })?;
        let options = KubeConfigOptions {
            context: self.context.clone(),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|source| SourceError::Kubeconfig {
                path: path.clone(),
                source,
            })?;

        Ok(ConnectionConfig::new(config, ConfigOrigin::Kubeconfig(path)))
    }
}

/// Ordered, short-circuiting credential lookup: in-cluster, then kubeconfig.
///
/// Each source is tried at most once per [`resolve`](Self::resolve) call.
#[derive(Debug, Clone)]
pub struct CredentialResolver<P = InClusterSource, F = KubeconfigSource> {
    in_cluster: P,
    kubeconfig: F,
}

impl CredentialResolver {
    /// In-cluster discovery with `~/.kube/config` as fallback
    pub fn new() -> Self {
        Self::with_sources(InClusterSource, KubeconfigSource::default())
    }

    /// Resolver honouring the kubeconfig path and context from the app config
    pub fn from_app_config(config: &AppConfig) -> Self {
        let kubeconfig = KubeconfigSource {
            path: config.kubeconfig.clone(),
            context: config.context.clone(),
        };
        Self::with_sources(InClusterSource, kubeconfig)
    }
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ConfigSource, F: ConfigSource> CredentialResolver<P, F> {
    pub fn with_sources(in_cluster: P, kubeconfig: F) -> Self {
        Self {
            in_cluster,
            kubeconfig,
        }
    }

    pub async fn resolve(&self) -> Result<ConnectionConfig, CredentialResolutionError> {
        let in_cluster = match self.in_cluster.load().await {
            Ok(config) => {
                tracing::info!("Using in-cluster configuration for {}", config.endpoint());
                return Ok(config);
            }
            Err(e) => e,
        };
        tracing::debug!("In-cluster configuration unavailable: {}", in_cluster);

        match self.kubeconfig.load().await {
            Ok(config) => {
                tracing::info!(
                    "Using kubeconfig {:?} for {}",
                    config.origin(),
                    config.endpoint()
                );
                Ok(config)
            }
            Err(kubeconfig) => {
                tracing::warn!("Kubeconfig unavailable: {}", kubeconfig);
                Err(CredentialResolutionError {
                    in_cluster,
                    kubeconfig,
                })
            }
        }
    }
}
