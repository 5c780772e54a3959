pub mod config;
pub mod error;
pub mod kubernetes;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use kubernetes::{
    ApiClient, BoxedReader, ConfigSource, CredentialResolver, ExecError, ExecOptions,
    ExecutionResult, Executor, ResourceLocator,
};

use tokio_util::sync::CancellationToken;

/// Run a command in a pod using whichever credentials are available.
///
/// Returns the remote stdout and stderr. On any failure no output is
/// returned, only the error.
pub async fn execute(
    target: &ResourceLocator,
    options: &ExecOptions,
    stdin: Option<BoxedReader>,
    cancel: &CancellationToken,
) -> Result<(String, String)> {
    execute_with(&CredentialResolver::new(), target, options, stdin, cancel).await
}

/// Like [`execute`], resolving credentials through `resolver`
pub async fn execute_with<P, F>(
    resolver: &CredentialResolver<P, F>,
    target: &ResourceLocator,
    options: &ExecOptions,
    stdin: Option<BoxedReader>,
    cancel: &CancellationToken,
) -> Result<(String, String)>
where
    P: ConfigSource,
    F: ConfigSource,
{
    let client = ApiClient::from_resolver(resolver)
        .await
        .inspect_err(|e| tracing::info!("Unable to get cluster client: {}", e))?;
    let result = Executor::new()
        .execute(&client, target, options, stdin, cancel)
        .await?;
    Ok(result.into_strings())
}
