//! Credential fallback chain tests

mod test_utils;

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use podexec::kubernetes::{
    ConfigOrigin, CredentialResolver, KubeconfigSource, ResourceLocator, SourceError,
};
use podexec::{Error, ExecOptions};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use test_utils::*;

const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[tokio::test]
async fn test_in_cluster_short_circuits() {
    let in_cluster = FakeSource::succeeding(ConfigOrigin::InCluster);
    let kubeconfig = FakeSource::succeeding(ConfigOrigin::Kubeconfig(PathBuf::from("/k")));
    let (in_cluster_calls, kubeconfig_calls) = (in_cluster.calls(), kubeconfig.calls());

    let resolver = CredentialResolver::with_sources(in_cluster, kubeconfig);
    let config = resolver.resolve().await.unwrap();

    assert_eq!(config.origin(), &ConfigOrigin::InCluster);
    assert_eq!(in_cluster_calls.load(Ordering::SeqCst), 1);
    assert_eq!(kubeconfig_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_falls_back_to_kubeconfig() {
    let path = PathBuf::from("/home/user/.kube/config");
    let in_cluster = FakeSource::missing(TOKEN_PATH);
    let kubeconfig = FakeSource::succeeding(ConfigOrigin::Kubeconfig(path.clone()));
    let (in_cluster_calls, kubeconfig_calls) = (in_cluster.calls(), kubeconfig.calls());

    let resolver = CredentialResolver::with_sources(in_cluster, kubeconfig);
    let config = resolver.resolve().await.unwrap();

    assert_eq!(config.origin(), &ConfigOrigin::Kubeconfig(path));
    assert_eq!(in_cluster_calls.load(Ordering::SeqCst), 1);
    assert_eq!(kubeconfig_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_both_failures_are_preserved() {
    let in_cluster = FakeSource::missing(TOKEN_PATH);
    let kubeconfig = FakeSource::missing("/home/user/.kube/config");
    let (in_cluster_calls, kubeconfig_calls) = (in_cluster.calls(), kubeconfig.calls());

    let resolver = CredentialResolver::with_sources(in_cluster, kubeconfig);
    let err = resolver.resolve().await.unwrap_err();

    assert!(matches!(err.in_cluster, SourceError::NotFound(ref p) if p.ends_with("token")));
    assert!(matches!(err.kubeconfig, SourceError::NotFound(ref p) if p.ends_with("config")));

    let message = err.to_string();
    assert!(message.contains("InClusterConfig"));
    assert!(message.contains("BuildConfigFromFlags"));
    assert!(message.contains("serviceaccount/token"));
    assert!(message.contains(".kube/config"));

    // Each source is attempted exactly once
    assert_eq!(in_cluster_calls.load(Ordering::SeqCst), 1);
    assert_eq!(kubeconfig_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_home_kubeconfig_fails_before_exec() {
    let home = TempDir::new().unwrap();
    let resolver = CredentialResolver::with_sources(
        FakeSource::missing(TOKEN_PATH),
        KubeconfigSource::in_home(home.path()),
    );
    let target = ResourceLocator::new("default", "pods");
    let options = ExecOptions::new(["ls"]);

    let err = podexec::execute_with(&resolver, &target, &options, None, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::CredentialResolution(inner) => {
            let message = inner.to_string();
            assert!(message.contains("InClusterConfig"));
            assert!(message.contains("BuildConfigFromFlags"));
            assert!(matches!(inner.kubeconfig, SourceError::NotFound(_)));
        }
        other => panic!("Expected CredentialResolution, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resolved_config_builds_client() {
    let resolver = CredentialResolver::with_sources(
        FakeSource::succeeding(ConfigOrigin::InCluster),
        FakeSource::missing("/unused"),
    );

    let client = podexec::ApiClient::from_resolver(&resolver).await.unwrap();

    assert!(client.endpoint().starts_with(ENDPOINT));
}
