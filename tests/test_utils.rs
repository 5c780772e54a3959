//! Test utilities for podexec
//!
//! Fake credential sources and fake upgraded sessions, so the resolver and
//! executor can be driven without a cluster.

#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::Config;
use podexec::kubernetes::{
    ApiClient, BoxError, BoxedReader, BoxedWriter, ConfigOrigin, ConfigSource, ConnectionConfig,
    ExecRequest, ExitStatus, SourceError, UpgradedSession, Upgrader,
};

pub const ENDPOINT: &str = "https://10.96.0.1:443";

/// A connection config pointing at a fake API server
pub fn connection(origin: ConfigOrigin) -> ConnectionConfig {
    ConnectionConfig::new(Config::new(ENDPOINT.parse().unwrap()), origin)
}

/// A client for executor tests. Never contacts the endpoint.
pub fn test_client() -> ApiClient {
    ApiClient::new(connection(ConfigOrigin::InCluster)).expect("Failed to build test client")
}

type LoadFn = Box<dyn Fn() -> Result<ConnectionConfig, SourceError> + Send + Sync>;

/// Credential source with a scripted outcome that counts its calls
pub struct FakeSource {
    load: LoadFn,
    calls: Arc<AtomicUsize>,
}

impl FakeSource {
    pub fn succeeding(origin: ConfigOrigin) -> Self {
        Self::new(move || Ok(connection(origin.clone())))
    }

    pub fn missing(path: &str) -> Self {
        let path = PathBuf::from(path);
        Self::new(move || Err(SourceError::NotFound(path.clone())))
    }

    fn new(
        load: impl Fn() -> Result<ConnectionConfig, SourceError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            load: Box::new(load),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared call counter, readable after the source is moved into a resolver
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl ConfigSource for FakeSource {
    async fn load(&self) -> Result<ConnectionConfig, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.load)()
    }
}

/// What happened to a fake session, observable after the executor returns
#[derive(Clone, Default)]
pub struct SessionProbe {
    streamed: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
}

impl SessionProbe {
    /// Whether the executor started reading the session's output
    pub fn streamed(&self) -> bool {
        self.streamed.load(Ordering::SeqCst)
    }

    /// Whether the session's connection was released
    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Scripted upgraded session
pub struct FakeSession {
    stdin: Option<BoxedWriter>,
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    status: Option<ExitStatus>,
    probe: SessionProbe,
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            stdin: None,
            stdout: None,
            stderr: None,
            status: Some(ExitStatus::exited(0)),
            probe: SessionProbe::default(),
        }
    }

    pub fn stdout(mut self, reader: impl tokio::io::AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(reader));
        self
    }

    pub fn stderr(mut self, reader: impl tokio::io::AsyncRead + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(reader));
        self
    }

    pub fn stdin(mut self, writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(writer));
        self
    }

    /// Status the server reports once output is drained; `None` simulates
    /// a connection that closes without one
    pub fn status(mut self, status: Option<ExitStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn probe(&self) -> SessionProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl UpgradedSession for FakeSession {
    fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.probe.streamed.store(true, Ordering::SeqCst);
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr.take()
    }

    async fn exit_status(&mut self) -> Option<ExitStatus> {
        self.status.take()
    }

    fn abort(&mut self) {
        self.probe.aborted.store(true, Ordering::SeqCst);
    }
}

/// Upgrader handing out one scripted session, or failing the handshake
pub struct FakeUpgrader {
    session: Mutex<Option<FakeSession>>,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeUpgrader {
    pub fn with_session(session: FakeSession) -> Self {
        Self {
            session: Mutex::new(Some(session)),
            failure: None,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn rejecting(reason: &str) -> Self {
        let mut upgrader = Self::with_session(FakeSession::new());
        upgrader.failure = Some(reason.to_string());
        upgrader
    }

    /// Hold the handshake open for `delay` before completing it
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// URLs of the requests this upgrader received
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upgrader for FakeUpgrader {
    type Session = FakeSession;

    async fn upgrade(
        &self,
        _client: &ApiClient,
        request: &ExecRequest,
    ) -> Result<FakeSession, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.url().to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.failure {
            return Err(Box::new(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                reason.clone(),
            )));
        }

        let session = self.session.lock().unwrap().take();
        session.ok_or_else(|| "session already used".into())
    }
}
