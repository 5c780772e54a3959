//! Kubernetes pod exec functionality
//!
//! Runs one command in a pod over an upgraded connection and captures its
//! stdout and stderr separately.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::Resource;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::client::ApiClient;
use super::session::{
    BoxError, BoxedReader, BoxedWriter, ExitStatus, KubeUpgrader, SessionGuard, SessionState,
    SessionTracker, UpgradedSession, Upgrader,
};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Schema error: {message}")]
    Schema {
        message: String,
        #[source]
        source: Option<kube::core::request::Error>,
    },
    #[error("Transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("Stream error: {0}")]
    Stream(#[source] io::Error),
    #[error("Exec cancelled by {reason} while {state}")]
    Cancelled {
        reason: CancelReason,
        state: SessionState,
    },
}

impl ExecError {
    /// Short, stable name for log fields and exit-code mapping
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Schema { .. } => "schema",
            Self::Transport { .. } => "transport",
            Self::Stream(_) => "stream",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// What interrupted a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Caller,
    Deadline(Duration),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => f.write_str("caller"),
            Self::Deadline(timeout) => write!(f, "deadline after {timeout:?}"),
        }
    }
}

/// Identifies the exec target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLocator {
    pub namespace: String,
    /// Plural resource name, e.g. `pods`
    pub resource: String,
    pub name: Option<String>,
    pub container: Option<String>,
}

impl ResourceLocator {
    pub fn new(namespace: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource: resource.into(),
            name: None,
            container: None,
        }
    }

    /// Locator for a named pod
    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(namespace, "pods").named(name)
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Check the locator names a single resource, returning its name
    fn validate(&self) -> Result<&str, ExecError> {
        if !is_dns_label(&self.namespace) {
            return Err(ExecError::InvalidArgument(format!(
                "invalid namespace {:?}",
                self.namespace
            )));
        }
        if !is_dns_label(&self.resource) {
            return Err(ExecError::InvalidArgument(format!(
                "invalid resource kind {:?}",
                self.resource
            )));
        }
        let name = self.name.as_deref().ok_or_else(|| {
            ExecError::InvalidArgument(format!("no {} name given in {}", self.resource, self))
        })?;
        if !is_dns_subdomain(name) {
            return Err(ExecError::InvalidArgument(format!("invalid name {name:?}")));
        }
        if let Some(container) = &self.container {
            if !is_dns_label(container) {
                return Err(ExecError::InvalidArgument(format!(
                    "invalid container {container:?}"
                )));
            }
        }
        Ok(name)
    }
}

impl fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.resource)?;
        if let Some(name) = &self.name {
            write!(f, "/{name}")?;
        }
        if let Some(container) = &self.container {
            write!(f, "[{container}]")?;
        }
        Ok(())
    }
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

fn is_dns_subdomain(s: &str) -> bool {
    s.len() <= 253 && s.split('.').all(is_dns_label)
}

/// Per-call exec settings
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub command: Vec<String>,
    /// Abort the session if it has not finished after this long
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Wrap in-memory bytes as a stdin source
pub fn stdin_bytes(bytes: impl Into<Vec<u8>>) -> BoxedReader {
    Box::new(io::Cursor::new(bytes.into()))
}

/// A validated exec request for one target
#[derive(Debug, Clone)]
pub struct ExecRequest {
    namespace: String,
    name: String,
    container: Option<String>,
    command: Vec<String>,
    stdin: bool,
    method: String,
    url: String,
}

impl ExecRequest {
    /// Build the exec request for `target`.
    ///
    /// Only resource kinds with an exec subresource are accepted.
    pub fn build(
        target: &ResourceLocator,
        command: &[String],
        stdin: bool,
    ) -> Result<Self, ExecError> {
        let name = target.validate()?;
        if command.is_empty() {
            return Err(ExecError::InvalidArgument("empty command".to_string()));
        }

        let url_path = exec_url_path(&target.resource, &target.namespace).ok_or_else(|| {
            ExecError::Schema {
                message: format!("resource kind {:?} has no exec subresource", target.resource),
                source: None,
            }
        })?;

        let mut request = Self {
            namespace: target.namespace.clone(),
            name: name.to_string(),
            container: target.container.clone(),
            command: command.to_vec(),
            stdin,
            method: String::new(),
            url: String::new(),
        };
        let (method, url) = exec_http_request(url_path, name, command, &request.attach_params())?;
        request.method = method;
        request.url = url;

        Ok(request)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request path and query, relative to the API server
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stream selection: stdout and stderr always, stdin on demand, never a TTY
    pub fn attach_params(&self) -> AttachParams {
        let params = AttachParams::default()
            .stdin(self.stdin)
            .stdout(true)
            .stderr(true)
            .tty(false);
        match &self.container {
            Some(container) => params.container(container.clone()),
            None => params,
        }
    }
}

fn exec_url_path(resource: &str, namespace: &str) -> Option<String> {
    match resource {
        "pods" | "pod" | "po" => Some(Pod::url_path(&(), Some(namespace))),
        _ => None,
    }
}

/// Method and path of the exec request, as the request builder produces them
fn exec_http_request(
    url_path: String,
    name: &str,
    command: &[String],
    params: &AttachParams,
) -> Result<(String, String), ExecError> {
    let http = kube::core::Request::new(url_path)
        .exec(name, command.iter().map(String::as_str), params)
        .map_err(|e| ExecError::Schema {
            message: format!("exec request for {name:?} rejected: {e}"),
            source: Some(e),
        })?;
    Ok((http.method().as_str().to_string(), http.uri().to_string()))
}

/// Output of a finished exec session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// How the remote command ended. A non-zero exit is not an error here.
    pub exit_status: ExitStatus,
}

impl ExecutionResult {
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.code
    }

    /// stdout and stderr as strings
    pub fn into_strings(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

enum Step<T> {
    Interrupted(CancelReason),
    Done(T),
}

async fn interrupted(
    cancel: &CancellationToken,
    deadline: Option<(Instant, Duration)>,
) -> CancelReason {
    match deadline {
        Some((at, timeout)) => tokio::select! {
            _ = cancel.cancelled() => CancelReason::Caller,
            _ = tokio::time::sleep_until(at) => CancelReason::Deadline(timeout),
        },
        None => {
            cancel.cancelled().await;
            CancelReason::Caller
        }
    }
}

/// Runs commands in pods, one upgraded session per call
#[derive(Debug, Clone, Default)]
pub struct Executor<U = KubeUpgrader> {
    upgrader: U,
}

impl Executor {
    pub fn new() -> Self {
        Self::with_upgrader(KubeUpgrader)
    }
}

impl<U: Upgrader> Executor<U> {
    pub fn with_upgrader(upgrader: U) -> Self {
        Self { upgrader }
    }

    pub fn upgrader(&self) -> &U {
        &self.upgrader
    }

    /// Run `options.command` in `target`, feeding `stdin` if given.
    ///
    /// Returns once the remote side closes the session, an error occurs or
    /// `cancel` fires. Output received before a failure is discarded. The
    /// upgraded connection is released before this returns on every path.
    pub async fn execute(
        &self,
        client: &ApiClient,
        target: &ResourceLocator,
        options: &ExecOptions,
        stdin: Option<BoxedReader>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        let mut tracker = SessionTracker::new(target.to_string());
        let deadline = options
            .timeout
            .map(|timeout| (Instant::now() + timeout, timeout));

        let request = ExecRequest::build(target, &options.command, stdin.is_some())
            .inspect_err(|e| tracing::debug!("Rejected exec request for {}: {}", target, e))?;
        tracker.advance(SessionState::RequestBuilt);
        tracing::debug!("Dumping request {} {}", request.method(), request.url());

        if cancel.is_cancelled() {
            let state = tracker.fail();
            return Err(ExecError::Cancelled {
                reason: CancelReason::Caller,
                state,
            });
        }

        let upgraded = tokio::select! {
            biased;
            reason = interrupted(cancel, deadline) => Step::Interrupted(reason),
            result = self.upgrader.upgrade(client, &request) => Step::Done(result),
        };
        let session = match upgraded {
            Step::Interrupted(reason) => {
                let state = tracker.fail();
                return Err(ExecError::Cancelled { reason, state });
            }
            Step::Done(Err(source)) => {
                tracker.fail();
                tracing::warn!("Upgrade failed for {}: {}", request.url(), source);
                return Err(ExecError::Transport {
                    url: request.url().to_string(),
                    source,
                });
            }
            Step::Done(Ok(session)) => session,
        };
        let mut session = SessionGuard::new(session);
        tracker.advance(SessionState::Upgraded);

        if cancel.is_cancelled() {
            let state = tracker.fail();
            return Err(ExecError::Cancelled {
                reason: CancelReason::Caller,
                state,
            });
        }

        tracker.advance(SessionState::Streaming);
        let streamed = tokio::select! {
            biased;
            reason = interrupted(cancel, deadline) => Step::Interrupted(reason),
            result = stream(&mut *session, stdin) => Step::Done(result),
        };

        match streamed {
            Step::Done(Ok(result)) => {
                tracker.advance(SessionState::Completed);
                tracing::info!(
                    "Exec in {} finished: {} stdout bytes, {} stderr bytes, exit code {:?}",
                    target,
                    result.stdout.len(),
                    result.stderr.len(),
                    result.exit_code()
                );
                Ok(result)
            }
            Step::Done(Err(e)) => {
                tracker.fail();
                tracing::warn!("Exec in {} failed: {}", target, e);
                Err(e)
            }
            Step::Interrupted(reason) => {
                let state = tracker.fail();
                tracing::info!("Exec in {} cancelled by {}", target, reason);
                Err(ExecError::Cancelled { reason, state })
            }
        }
    }
}

/// Drive an upgraded session to completion.
///
/// Finishes once stdout and stderr are drained and the status frame has
/// arrived. Forwarding stdin runs alongside and is dropped at that point, so a
/// local stdin that never reaches EOF cannot hold the session open.
async fn stream<S: UpgradedSession>(
    session: &mut S,
    stdin: Option<BoxedReader>,
) -> Result<ExecutionResult, ExecError> {
    let remote_stdin = session.take_stdin();
    let stdout = session.take_stdout();
    let stderr = session.take_stderr();

    let mut result = ExecutionResult::default();
    let status = {
        let feed = feed_stdin(stdin, remote_stdin);
        let output = async {
            tokio::try_join!(
                drain(stdout, &mut result.stdout),
                drain(stderr, &mut result.stderr),
            )?;
            Ok::<_, io::Error>(session.exit_status().await)
        };
        tokio::pin!(feed, output);

        let mut feeding = true;
        loop {
            tokio::select! {
                fed = &mut feed, if feeding => {
                    fed.map_err(ExecError::Stream)?;
                    feeding = false;
                }
                done = &mut output => break done.map_err(ExecError::Stream)?,
            }
        }
    };

    result.exit_status = status.ok_or_else(|| {
        ExecError::Stream(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before the exit status was reported",
        ))
    })?;

    Ok(result)
}

async fn feed_stdin(source: Option<BoxedReader>, sink: Option<BoxedWriter>) -> io::Result<()> {
    let (Some(mut source), Some(mut sink)) = (source, sink) else {
        return Ok(());
    };

    let copied = match tokio::io::copy(&mut source, &mut sink).await {
        Ok(n) => sink.shutdown().await.map(|()| n),
        Err(e) => Err(e),
    };
    match copied {
        Ok(n) => {
            tracing::trace!("Forwarded {} stdin bytes", n);
            Ok(())
        }
        // The remote command may exit without reading all of its input
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            tracing::debug!("Remote side closed stdin early");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn drain(reader: Option<BoxedReader>, buf: &mut Vec<u8>) -> io::Result<()> {
    if let Some(mut reader) = reader {
        reader.read_to_end(buf).await?;
    }
    Ok(())
}
