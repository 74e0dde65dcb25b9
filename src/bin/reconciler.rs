//! reconciler - the per-sync worker pipeline.
//!
//! Runs inside a worker pod provisioned by the reconciler-manager, wired
//! entirely through environment variables. Reads the shared filesystem the
//! source-sync and hydration-controller sidecars maintain, and applies the
//! declared configuration to the cluster.

use kube::Client;
use tokio::signal;
use tracing::{error, info};

use sync_operator::reconciler::{ReconcilerOpts, run_reconciler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sync_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .init();

    let opts = match ReconcilerOpts::from_env() {
        Ok(opts) => opts,
        Err(e) => {
            error!("Invalid reconciler configuration: {e}");
            std::process::exit(1);
        }
    };

    let client = Client::try_default().await?;
    info!(reconciler = %opts.reconciler_name, "Connected to Kubernetes cluster");

    tokio::select! {
        _ = run_reconciler(client, opts) => {
            error!("Reconciler loop ended unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping reconciler");
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
