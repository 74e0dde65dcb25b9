//! hydration-controller - the rendering sidecar.
//!
//! Watches the source side of the shared filesystem and renders new commits
//! through the declared renderer, publishing results via the hydrated
//! symlink, the done file, and the error sentinel.

use std::path::PathBuf;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info};

use sync_operator::crd::SourceType;
use sync_operator::reconciler::REPO_ROOT;
use sync_operator::reconciler::hydrate::Hydrator;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_period(name: &str, default_secs: u64) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().trim_end_matches('s').parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(default_secs))
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

    let source_type: SourceType = env_or("SOURCE_TYPE", "git").parse().map_err(
        |e: String| -> Box<dyn std::error::Error> { e.into() },
    )?;
    let source_container = match source_type {
        SourceType::Git => "git-sync",
        SourceType::Oci => "oci-sync",
        SourceType::Helm => "helm-sync",
    };

    let hydrator = Hydrator {
        source_type,
        source_root: PathBuf::from(REPO_ROOT).join("source"),
        hydrated_root: PathBuf::from(REPO_ROOT).join("hydrated"),
        sync_dir: env_or("SYNC_DIR", "."),
        polling_period: env_period("HYDRATION_POLLING_PERIOD", 5),
        rehydrate_period: env_period("REHYDRATE_PERIOD", 1800),
        source_container: source_container.to_string(),
        enable_shell: env_or("RENDERING_ENABLE_SHELL", "false") == "true",
    };

    info!(
        sync_dir = %hydrator.sync_dir,
        source = %hydrator.source_type,
        "Starting hydration controller"
    );

    tokio::select! {
        _ = hydrator.run() => {
            error!("Hydration loop ended unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping hydration controller");
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
