//! The per-sync reconciler worker: fetch -> render -> parse -> apply ->
//! remediate, with status written back to the owning sync object.
//!
//! The worker pod runs one container per pipeline stage; the stages hand
//! off through the shared filesystem contract in `filesystem`. This module
//! wires the reconciler container itself: the orchestrator loop plus the
//! remediator, configured entirely from the environment the manager
//! injected into the Deployment.

pub mod applier;
pub mod fetcher;
pub mod filesystem;
pub mod hydrate;
pub mod inventory;
pub mod orchestrator;
pub mod parse;
pub mod remediator;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tracing::info;

use crate::crd::{
    NamespaceStrategy, RepoSync, RootSync, Scope, SourceFormat, SourceType, StatusMode, SyncApi,
};
use crate::reconciler::applier::Applier;
use crate::reconciler::orchestrator::{Orchestrator, OrchestratorTiming};
use crate::reconciler::parse::ParseOptions;
use crate::reconciler::remediator::Remediator;
use crate::reconciler::status::{SourceInfo, StatusClient};

/// Shared filesystem root inside the worker pod.
pub const REPO_ROOT: &str = "/repo";

fn env_var(name: &str) -> Result<String, String> {
    std::env::var(name).map_err(|_| format!("missing required environment variable {name}"))
}

fn env_var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Parse a duration like `300s` or a bare number of seconds.
fn parse_period(value: &str, default: Duration) -> Duration {
    let trimmed = value.trim().trim_end_matches('s');
    trimmed
        .parse::<u64>()
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Reconciler configuration, read from the environment injected by the
/// manager (see the deployment builder for the other side).
#[derive(Clone, Debug)]
pub struct ReconcilerOpts {
    pub cluster_name: String,
    pub scope: Scope,
    pub sync_name: String,
    pub reconciler_name: String,
    pub sync_dir: String,
    pub source_type: SourceType,
    pub source_repo: String,
    pub source_branch: Option<String>,
    pub source_rev: String,
    pub source_format: SourceFormat,
    pub namespace_strategy: NamespaceStrategy,
    pub status_mode: StatusMode,
    pub rendering_enabled: bool,
    pub reconcile_timeout: Duration,
    pub api_server_timeout: Duration,
    pub polling_period: Duration,
}

impl ReconcilerOpts {
    pub fn from_env() -> Result<Self, String> {
        Ok(ReconcilerOpts {
            cluster_name: env_var_or("CLUSTER_NAME", ""),
            scope: Scope::parse(&env_var("SCOPE")?),
            sync_name: env_var("SYNC_NAME")?,
            reconciler_name: env_var("RECONCILER_NAME")?,
            sync_dir: env_var_or("SYNC_DIR", "."),
            source_type: env_var_or("SOURCE_TYPE", "git")
                .parse()
                .map_err(|e: String| e)?,
            source_repo: env_var_or("SOURCE_REPO", ""),
            source_branch: std::env::var("SOURCE_BRANCH").ok().filter(|b| !b.is_empty()),
            source_rev: env_var_or("SOURCE_REV", "HEAD"),
            source_format: env_var_or("SOURCE_FORMAT", "unstructured")
                .parse()
                .map_err(|e: String| e)?,
            namespace_strategy: match env_var_or("NAMESPACE_STRATEGY", "implicit").as_str() {
                "explicit" => NamespaceStrategy::Explicit,
                _ => NamespaceStrategy::Implicit,
            },
            status_mode: match env_var_or("STATUS_MODE", "enabled").as_str() {
                "disabled" => StatusMode::Disabled,
                _ => StatusMode::Enabled,
            },
            rendering_enabled: env_var_or("RENDERING_ENABLED", "true") == "true",
            reconcile_timeout: parse_period(
                &env_var_or("RECONCILE_TIMEOUT", "300s"),
                Duration::from_secs(300),
            ),
            api_server_timeout: parse_period(
                &env_var_or("API_SERVER_TIMEOUT", "15s"),
                Duration::from_secs(15),
            ),
            polling_period: parse_period(
                &env_var_or("RECONCILER_POLLING_PERIOD", "15s"),
                Duration::from_secs(15),
            ),
        })
    }

    /// Name of the fetcher container, for error attribution in status.
    pub fn source_container(&self) -> &'static str {
        match self.source_type {
            SourceType::Git => "git-sync",
            SourceType::Oci => "oci-sync",
            SourceType::Helm => "helm-sync",
        }
    }
}

/// Run the reconciler until terminated, dispatching on the sync kind.
pub async fn run_reconciler(client: Client, opts: ReconcilerOpts) {
    match &opts.scope {
        Scope::Root => run_scoped::<RootSync>(client, opts).await,
        Scope::Namespace(_) => run_scoped::<RepoSync>(client, opts).await,
    }
}

async fn run_scoped<S: SyncApi>(client: Client, opts: ReconcilerOpts) {
    info!(
        sync = %opts.sync_name,
        kind = S::sync_kind(),
        reconciler = %opts.reconciler_name,
        source = %opts.source_type,
        "Starting reconciler"
    );

    let source_info = SourceInfo {
        source_type: opts.source_type,
        repo: opts.source_repo.clone(),
        branch: opts.source_branch.clone(),
        revision: opts.source_rev.clone(),
        sync_dir: opts.sync_dir.clone(),
    };
    let status = Arc::new(StatusClient::<S>::new(
        client.clone(),
        &opts.scope,
        opts.sync_name.clone(),
        source_info,
    ));

    let (remediator, conflict_rx) = Remediator::new(
        client.clone(),
        opts.scope.clone(),
        opts.sync_name.clone(),
        opts.reconciler_name.clone(),
    );

    let applier = Applier::new(
        client.clone(),
        opts.scope.clone(),
        opts.sync_name.clone(),
        opts.reconciler_name.clone(),
        opts.api_server_timeout,
        opts.reconcile_timeout,
        opts.status_mode,
    );

    let parse_opts = ParseOptions {
        scope: opts.scope.clone(),
        sync_name: opts.sync_name.clone(),
        sync_kind: S::sync_kind(),
        source_format: opts.source_format,
        namespace_strategy: opts.namespace_strategy,
        source_url: opts.source_repo.clone(),
    };

    let orchestrator = Orchestrator {
        client,
        scope: opts.scope.clone(),
        sync_name: opts.sync_name.clone(),
        source_type: opts.source_type,
        source_root: PathBuf::from(REPO_ROOT).join("source"),
        hydrated_root: PathBuf::from(REPO_ROOT).join("hydrated"),
        sync_dir: opts.sync_dir.clone(),
        source_container: opts.source_container().to_string(),
        rendering_enabled: opts.rendering_enabled,
        timing: OrchestratorTiming {
            polling_period: opts.polling_period,
            ..Default::default()
        },
        status,
        applier,
        remediator,
        parse_opts,
    };
    orchestrator.run(conflict_rx).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_period_formats() {
        assert_eq!(parse_period("300s", Duration::ZERO), Duration::from_secs(300));
        assert_eq!(parse_period("15", Duration::ZERO), Duration::from_secs(15));
        assert_eq!(
            parse_period("bogus", Duration::from_secs(7)),
            Duration::from_secs(7)
        );
    }
}
