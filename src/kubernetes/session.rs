//! Upgraded exec sessions
//!
//! The transport seam between the executor and the cluster: an [`Upgrader`]
//! turns a built exec request into an [`UpgradedSession`] carrying the
//! demultiplexed stdin/stdout/stderr channels of one remote command.

use std::fmt;
use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::AttachedProcess;
use tokio::io::{AsyncRead, AsyncWrite};

use super::client::ApiClient;
use super::exec::ExecRequest;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of one exec session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RequestBuilt,
    Upgraded,
    Streaming,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` directly follows `self`; no state may be skipped
    pub fn can_advance_to(self, next: SessionState) -> bool {
        match (self, next) {
            (Self::Idle, Self::RequestBuilt)
            | (Self::RequestBuilt, Self::Upgraded)
            | (Self::Upgraded, Self::Streaming)
            | (Self::Streaming, Self::Completed) => true,
            (current, Self::Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::RequestBuilt => "request-built",
            Self::Upgraded => "upgraded",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the state of one session and logs transitions
#[derive(Debug)]
pub(crate) struct SessionTracker {
    target: String,
    state: SessionState,
}

impl SessionTracker {
    pub(crate) fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            state: SessionState::Idle,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid exec session transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!("Exec session {}: {} -> {}", self.target, self.state, next);
        self.state = next;
    }

    /// Mark the session failed, returning the state it failed in
    pub(crate) fn fail(&mut self) -> SessionState {
        let failed_in = self.state;
        if !failed_in.is_terminal() {
            self.advance(SessionState::Failed);
        }
        failed_in
    }
}

/// How the remote command ended, as reported by the server's status frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, when the server reported one
    pub code: Option<i32>,
    pub message: Option<String>,
}

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            message: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn from_status(status: &Status) -> Self {
        if status.status.as_deref() == Some("Success") {
            return Self::exited(0);
        }

        let code = if status.reason.as_deref() == Some("NonZeroExitCode") {
            status
                .details
                .as_ref()
                .and_then(|details| details.causes.as_ref())
                .and_then(|causes| {
                    causes
                        .iter()
                        .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
                })
                .and_then(|cause| cause.message.as_deref())
                .and_then(|code| code.trim().parse().ok())
        } else {
            None
        };

        Self {
            code,
            message: status.message.clone(),
        }
    }
}

/// An established, multiplexed exec connection
#[async_trait]
pub trait UpgradedSession: Send {
    fn take_stdin(&mut self) -> Option<BoxedWriter>;
    fn take_stdout(&mut self) -> Option<BoxedReader>;
    fn take_stderr(&mut self) -> Option<BoxedReader>;

    /// Wait for the server's status frame.
    ///
    /// `None` means the connection closed without reporting one.
    async fn exit_status(&mut self) -> Option<ExitStatus>;

    /// Tear down the connection. Must be idempotent.
    fn abort(&mut self);
}

/// Performs upgrade negotiation for a built exec request
#[async_trait]
pub trait Upgrader: Send + Sync {
    type Session: UpgradedSession;

    async fn upgrade(
        &self,
        client: &ApiClient,
        request: &ExecRequest,
    ) -> Result<Self::Session, BoxError>;
}

/// Owns a session for the duration of one exec call and aborts it on drop,
/// whichever way the call returns.
pub(crate) struct SessionGuard<S: UpgradedSession> {
    session: S,
}

impl<S: UpgradedSession> SessionGuard<S> {
    pub(crate) fn new(session: S) -> Self {
        Self { session }
    }
}

impl<S: UpgradedSession> Deref for SessionGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: UpgradedSession> DerefMut for SessionGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

impl<S: UpgradedSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        self.session.abort();
        tracing::trace!("Exec session released");
    }
}

/// WebSocket upgrade through the kube client
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeUpgrader;

#[async_trait]
impl Upgrader for KubeUpgrader {
    type Session = KubeSession;

    async fn upgrade(
        &self,
        client: &ApiClient,
        request: &ExecRequest,
    ) -> Result<KubeSession, BoxError> {
        let pods = client.pods(request.namespace());
        let attached = pods
            .exec(request.name(), request.command().to_vec(), &request.attach_params())
            .await?;
        Ok(KubeSession::new(attached))
    }
}

/// Session backed by kube's attached process
pub struct KubeSession {
    attached: AttachedProcess,
    status: Option<BoxFuture<'static, Option<Status>>>,
}

impl KubeSession {
    pub fn new(mut attached: AttachedProcess) -> Self {
        let status = attached.take_status().map(FutureExt::boxed);
        Self { attached, status }
    }
}

#[async_trait]
impl UpgradedSession for KubeSession {
    fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.attached
            .stdin()
            .map(|writer| Box::new(writer) as BoxedWriter)
    }

    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.attached
            .stdout()
            .map(|reader| Box::new(reader) as BoxedReader)
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.attached
            .stderr()
            .map(|reader| Box::new(reader) as BoxedReader)
    }

    async fn exit_status(&mut self) -> Option<ExitStatus> {
        let status = self.status.take()?.await?;
        Some(ExitStatus::from_status(&status))
    }

    fn abort(&mut self) {
        self.attached.abort();
    }
}
