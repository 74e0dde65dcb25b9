//! Status surface: idempotent, size-aware writes of the source, rendering,
//! and sync blocks onto the owning sync object.
//!
//! Every write follows fetch -> mutate -> diff-equal-check -> update. A
//! `413 Request Entity Too Large` response halves the retained error list
//! (doubling denominator) and retries, preserving the pre-truncation count
//! in the error summary. All writes serialize behind one mutex; remediator
//! conflict reports merge in through the same path.

use kube::Api;
use kube::api::{Patch, PatchParams};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crd::status::{
    ErrorSource, ErrorSummary, GitSourceStatus, HelmSourceStatus, OciSourceStatus,
};
use crate::crd::{ConfigSyncError, Scope, SourceType, SyncApi};
use crate::errors::{StatusError, codes, to_cse_list};

const DEFAULT_DENOMINATOR: usize = 1;
const MAX_DENOMINATOR: usize = 1024;

/// Descriptor of where this sync pulls from, echoed into status blocks.
#[derive(Clone, Debug)]
pub struct SourceInfo {
    pub source_type: SourceType,
    pub repo: String,
    pub branch: Option<String>,
    pub revision: String,
    pub sync_dir: String,
}

impl SourceInfo {
    fn git(&self) -> Option<GitSourceStatus> {
        (self.source_type == SourceType::Git).then(|| GitSourceStatus {
            repo: self.repo.clone(),
            branch: self.branch.clone(),
            revision: Some(self.revision.clone()),
            dir: Some(self.sync_dir.clone()),
        })
    }

    fn oci(&self) -> Option<OciSourceStatus> {
        (self.source_type == SourceType::Oci).then(|| OciSourceStatus {
            image: self.repo.clone(),
            dir: Some(self.sync_dir.clone()),
        })
    }

    fn helm(&self) -> Option<HelmSourceStatus> {
        (self.source_type == SourceType::Helm).then(|| HelmSourceStatus {
            repo: self.repo.clone(),
            chart: self.sync_dir.clone(),
            version: Some(self.revision.clone()),
        })
    }
}

/// Truncate an error list by a denominator, keeping the real total.
fn truncate_errors(
    errors: &[ConfigSyncError],
    denominator: usize,
) -> (Vec<ConfigSyncError>, ErrorSummary) {
    let keep = errors.len() / denominator;
    let summary = ErrorSummary {
        total_count: errors.len() as i32,
        truncated: denominator != 1,
        error_count_after_truncation: keep as i32,
    };
    (errors[..keep].to_vec(), summary)
}

fn is_request_too_large(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 413)
}

fn now_rfc3339() -> String {
    jiff::Timestamp::now().to_string()
}

/// Which pipeline stage a write updates.
enum Stage<'a> {
    Source,
    Rendering { message: &'a str },
    Sync { syncing: bool },
}

/// Writes sync status for one sync object.
pub struct StatusClient<S: SyncApi> {
    api: Api<S>,
    sync_name: String,
    source: SourceInfo,
    lock: Mutex<()>,
}

impl<S: SyncApi> StatusClient<S> {
    pub fn new(client: kube::Client, scope: &Scope, sync_name: String, source: SourceInfo) -> Self {
        StatusClient {
            api: S::scoped_api(client, scope),
            sync_name,
            source,
            lock: Mutex::new(()),
        }
    }

    async fn get(&self) -> Result<S, StatusError> {
        self.api.get(&self.sync_name).await.map_err(|e| {
            StatusError::api_server(format!(
                "failed to get {} {}: {e}",
                S::sync_kind(),
                self.sync_name
            ))
        })
    }

    async fn write(&self, obj: &S) -> Result<(), kube::Error> {
        let patch = serde_json::json!({
            "apiVersion": format!("{}/v1beta1", crate::crd::API_GROUP),
            "kind": S::sync_kind(),
            "status": obj.sync_status(),
        });
        self.api
            .patch_status(
                &self.sync_name,
                &PatchParams::apply("reconciler").force(),
                &Patch::Apply(&patch),
            )
            .await
            .map(|_| ())
    }

    /// Record the fetch stage outcome.
    pub async fn set_source_status(
        &self,
        commit: &str,
        errs: &[StatusError],
    ) -> Result<(), StatusError> {
        let _guard = self.lock.lock().await;
        self.set_stage_status(Stage::Source, commit, errs).await
    }

    /// Record the rendering stage outcome.
    pub async fn set_rendering_status(
        &self,
        commit: &str,
        message: &str,
        errs: &[StatusError],
    ) -> Result<(), StatusError> {
        let _guard = self.lock.lock().await;
        self.set_stage_status(Stage::Rendering { message }, commit, errs)
            .await
    }

    /// Record the apply stage outcome.
    ///
    /// `lastSyncedCommit` only advances when the pass is finished and the
    /// combined error summary is empty; it never regresses.
    pub async fn set_sync_status(
        &self,
        commit: &str,
        syncing: bool,
        errs: &[StatusError],
    ) -> Result<(), StatusError> {
        let _guard = self.lock.lock().await;
        self.set_stage_status(Stage::Sync { syncing }, commit, errs)
            .await
    }

    /// Fetch, mutate one stage block, and write, halving the retained error
    /// list on oversized-object responses.
    async fn set_stage_status(
        &self,
        stage: Stage<'_>,
        commit: &str,
        errs: &[StatusError],
    ) -> Result<(), StatusError> {
        let cse = to_cse_list(errs);
        let mut denominator = DEFAULT_DENOMINATOR;
        loop {
            let mut obj = self.get().await?;
            let before = obj.sync_status().cloned().unwrap_or_default();
            let now = now_rfc3339();

            let (kept, summary) = truncate_errors(&cse, denominator);
            let has_errors = !kept.is_empty();
            let status = obj.sync_status_mut();

            match &stage {
                Stage::Source => {
                    status.source.commit = commit.to_string();
                    status.source.git = self.source.git();
                    status.source.oci = self.source.oci();
                    status.source.helm = self.source.helm();
                    status.source.errors = kept;
                    status.source.error_summary = Some(summary.clone());
                    status.source.last_update = Some(now.clone());
                    let sources = has_errors
                        .then(|| vec![ErrorSource::SourceError])
                        .unwrap_or_default();
                    status.set_syncing(
                        summary.total_count == 0,
                        "Source",
                        "Source",
                        commit,
                        sources,
                        summary,
                        &now,
                    );
                }
                Stage::Rendering { message } => {
                    status.rendering.commit = commit.to_string();
                    status.rendering.message = message.to_string();
                    status.rendering.git = self.source.git();
                    status.rendering.oci = self.source.oci();
                    status.rendering.helm = self.source.helm();
                    status.rendering.errors = kept;
                    status.rendering.error_summary = Some(summary.clone());
                    status.rendering.last_update = Some(now.clone());
                    let sources = has_errors
                        .then(|| vec![ErrorSource::RenderingError])
                        .unwrap_or_default();
                    status.set_syncing(
                        summary.total_count == 0,
                        "Rendering",
                        message,
                        commit,
                        sources,
                        summary,
                        &now,
                    );
                }
                Stage::Sync { syncing } => {
                    status.sync.commit = commit.to_string();
                    status.sync.git = status.source.git.clone();
                    status.sync.oci = status.source.oci.clone();
                    status.sync.helm = status.source.helm.clone();
                    status.sync.errors = kept;
                    status.sync.error_summary = Some(summary);
                    status.sync.last_update = Some(now.clone());

                    let (sources, combined) =
                        crate::crd::status::summarize_errors(&status.source, &status.sync);
                    if *syncing {
                        status.set_syncing(
                            true, "Sync", "Syncing", commit, sources, combined, &now,
                        );
                    } else {
                        if combined.total_count == 0 {
                            status.last_synced_commit = commit.to_string();
                        }
                        status.set_syncing(
                            false,
                            "Sync",
                            "Sync Completed",
                            commit,
                            sources,
                            combined,
                            &now,
                        );
                    }
                }
            }

            if before.equal_ignoring_timestamps(obj.sync_status_mut()) {
                debug!(sync = %self.sync_name, "Skipping no-op status update");
                return Ok(());
            }

            match self.write(&obj).await {
                Ok(()) => return Ok(()),
                Err(e) if is_request_too_large(&e) && denominator < MAX_DENOMINATOR => {
                    denominator *= 2;
                    warn!(
                        sync = %self.sync_name,
                        total = cse.len(),
                        denominator,
                        "Status update too large, truncating error list"
                    );
                }
                Err(e) => {
                    return Err(StatusError::api_server(format!(
                        "failed to update {} status: {e}",
                        S::sync_kind()
                    )));
                }
            }
        }
    }

    /// Prepend remediator conflict reports to the sync errors, deduping on
    /// message against errors already present.
    pub async fn prepend_conflict_errors(
        &self,
        conflicts: &[StatusError],
    ) -> Result<(), StatusError> {
        if conflicts.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;

        let mut denominator = DEFAULT_DENOMINATOR;
        loop {
            let mut obj = self.get().await?;
            let status = obj.sync_status_mut();

            let mut fresh: Vec<ConfigSyncError> = Vec::new();
            for conflict in conflicts {
                let cse = conflict.to_cse();
                let already = status.sync.errors.iter().any(|e| {
                    e.code == codes::MANAGEMENT_CONFLICT
                        && e.error_message == cse.error_message
                }) || fresh.iter().any(|e| e.error_message == cse.error_message);
                if !already {
                    fresh.push(cse);
                }
            }
            if fresh.is_empty() {
                return Ok(());
            }
            info!(sync = %self.sync_name, count = fresh.len(), "Recording management conflicts");

            // Conflicts go first for more visibility.
            fresh.append(&mut status.sync.errors);
            let (kept, summary) = truncate_errors(&fresh, denominator);
            status.sync.errors = kept;
            status.sync.error_summary = Some(summary);
            status.sync.last_update = Some(now_rfc3339());

            match self.write(&obj).await {
                Ok(()) => return Ok(()),
                Err(e) if is_request_too_large(&e) && denominator < MAX_DENOMINATOR => {
                    denominator *= 2;
                    warn!(
                        sync = %self.sync_name,
                        denominator,
                        "Conflict update too large, truncating error list"
                    );
                }
                Err(e) => {
                    return Err(StatusError::api_server(format!(
                        "failed to update {} sync status: {e}",
                        S::sync_kind()
                    )));
                }
            }
        }
    }
}
