use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use podexec::kubernetes::{ExecOptions, ResourceLocator};
use podexec::{AppConfig, BoxedReader, CredentialResolver};

#[derive(Parser)]
#[command(name = "podexec")]
#[command(about = "Run a command in a Kubernetes pod and capture its output", long_about = None)]
struct Cli {
    /// Pod to run the command in
    pod: String,

    /// Command and arguments, after `--`; defaults to the config file's command
    #[arg(last = true)]
    command: Vec<String>,

    /// Namespace of the pod
    #[arg(short, long)]
    namespace: Option<String>,

    /// Container within the pod
    #[arg(short, long)]
    container: Option<String>,

    /// Kubeconfig context to use outside a cluster
    #[arg(long)]
    context: Option<String>,

    /// Kubeconfig file to use outside a cluster
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Abort the command after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Forward standard input to the command
    #[arg(short = 'i', long)]
    stdin: bool,

    /// Application config file
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Command-line flags take precedence over the config file
    fn apply_to(&self, config: &mut AppConfig) {
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(container) = &self.container {
            config.container = Some(container.clone());
        }
        if let Some(context) = &self.context {
            config.context = Some(context.clone());
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            config.kubeconfig = Some(kubeconfig.clone());
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = Some(timeout);
        }
        if !self.command.is_empty() {
            config.command = self.command.clone();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout carries only the remote output
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    let mut config = loaded.unwrap_or_else(|e| {
        tracing::warn!("Ignoring unreadable config: {}", e);
        AppConfig::default()
    });
    cli.apply_to(&mut config);

    let mut target = ResourceLocator::pod(config.namespace.clone(), cli.pod.clone());
    if let Some(container) = &config.container {
        target = target.container(container.clone());
    }
    let mut options = ExecOptions::new(config.command.clone());
    if let Some(timeout) = config.timeout() {
        options = options.with_timeout(timeout);
    }
    let stdin = cli
        .stdin
        .then(|| Box::new(tokio::io::stdin()) as BoxedReader);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling exec session");
            on_interrupt.cancel();
        }
    });

    let resolver = CredentialResolver::from_app_config(&config);
    let started = std::time::Instant::now();
    let outcome = podexec::execute_with(&resolver, &target, &options, stdin, &cancel).await;
    tracing::debug!("Exec took {:?}", started.elapsed());

    match outcome {
        Ok((stdout, stderr)) => {
            match write_output(&stdout, &stderr).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("Failed to write command output: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            tracing::error!(kind = e.kind(), "{}", e);
            eprintln!("podexec: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn write_output(stdout: &str, stderr: &str) -> std::io::Result<()> {
    let mut out = tokio::io::stdout();
    let mut err = tokio::io::stderr();
    out.write_all(stdout.as_bytes()).await?;
    out.flush().await?;
    err.write_all(stderr.as_bytes()).await?;
    err.flush().await
}
