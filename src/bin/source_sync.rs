//! source-sync - the source fetcher sidecar.
//!
//! Runs as the git-sync / oci-sync / helm-sync container, mirroring the
//! declared source into per-revision directories under /repo/source and
//! maintaining the rev symlink and error sentinel.

use std::path::PathBuf;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info};

use sync_operator::crd::{AuthType, SourceType};
use sync_operator::reconciler::REPO_ROOT;
use sync_operator::reconciler::fetcher::{CA_CERT_FILE, Fetcher, FetcherConfig};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_secs(name: &str, default_secs: u64) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().trim_end_matches('s').parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(default_secs))
}

fn config_from_env() -> Result<FetcherConfig, String> {
    let source_type: SourceType = env_or("SOURCE_TYPE", "git").parse()?;
    let (repo, revision, period, auth, container) = match source_type {
        SourceType::Git => (
            std::env::var("GIT_SYNC_REPO").map_err(|_| "GIT_SYNC_REPO is required")?,
            env_or("GIT_SYNC_REV", "HEAD"),
            env_secs("GIT_SYNC_PERIOD", 15),
            env_or("GIT_SYNC_AUTH", "none").parse::<AuthType>()?,
            "git-sync",
        ),
        SourceType::Oci => (
            std::env::var("OCI_SYNC_IMAGE").map_err(|_| "OCI_SYNC_IMAGE is required")?,
            String::new(),
            env_secs("OCI_SYNC_WAIT", 15),
            env_or("OCI_SYNC_AUTH", "none").parse::<AuthType>()?,
            "oci-sync",
        ),
        SourceType::Helm => (
            std::env::var("HELM_REPO").map_err(|_| "HELM_REPO is required")?,
            env_or("HELM_CHART_VERSION", "latest"),
            env_secs("HELM_SYNC_WAIT", 3600),
            env_or("HELM_AUTH_TYPE", "none").parse::<AuthType>()?,
            "helm-sync",
        ),
    };

    let ca_cert_file = PathBuf::from(CA_CERT_FILE);
    Ok(FetcherConfig {
        source_type,
        repo,
        branch: std::env::var("GIT_SYNC_BRANCH").ok().filter(|b| !b.is_empty()),
        revision,
        chart: env_or("HELM_CHART", ""),
        auth,
        username: std::env::var("GIT_SYNC_USERNAME")
            .or_else(|_| std::env::var("HELM_USERNAME"))
            .ok(),
        password: std::env::var("GIT_SYNC_PASSWORD")
            .or_else(|_| std::env::var("HELM_PASSWORD"))
            .ok(),
        depth: env_or("GIT_SYNC_DEPTH", "1").parse().unwrap_or(1),
        period,
        no_ssl_verify: env_or("GIT_SYNC_NO_SSL_VERIFY", "false") == "true",
        ca_cert_file: ca_cert_file.exists().then_some(ca_cert_file),
        root: PathBuf::from(REPO_ROOT).join("source"),
        container: container.to_string(),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sync_operator=info".parse()?),
        )
        .json()
        .init();

    let config = match config_from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid fetcher configuration: {e}");
            std::process::exit(1);
        }
    };
    info!(
        source = %config.source_type,
        repo = %config.repo,
        "Starting source fetcher"
    );

    let fetcher = Fetcher::new(config);
    tokio::select! {
        _ = fetcher.run() => {
            error!("Fetcher loop ended unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping fetcher");
        }
    }
    Ok(())
}

#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
