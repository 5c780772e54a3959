//! Kubernetes integration module
//!
//! Provides credential resolution, API client construction, and pod exec
//! with captured output.

pub mod config;
pub mod client;
pub mod exec;
pub mod session;

pub use config::{
    AuthKind, ConfigOrigin, ConfigSource, ConnectionConfig, CredentialResolutionError,
    CredentialResolver, InClusterSource, KubeconfigSource, SourceError,
};
pub use client::{ApiClient, ClientConstructionError};
pub use exec::{
    stdin_bytes, CancelReason, ExecError, ExecOptions, ExecRequest, ExecutionResult, Executor,
    ResourceLocator,
};
pub use session::{
    BoxError, BoxedReader, BoxedWriter, ExitStatus, KubeSession, KubeUpgrader, SessionState,
    UpgradedSession, Upgrader,
};
