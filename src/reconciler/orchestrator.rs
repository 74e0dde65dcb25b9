//! The reconciler's cooperative loop.
//!
//! One task owns the pipeline: observe the source and hydrated symlinks,
//! and when the active commit advances (or a resync fires) run
//! parse -> validate -> apply and record status. Remediator conflict
//! reports arrive over a channel and merge into the same mutex-guarded
//! status path. Failed passes retry with linear backoff on the retry
//! period; source and rendering sentinels surface without applying.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::crd::{Scope, SourceType, SyncApi};
use crate::errors::{RenderingErrorClass, StatusError, has_blocking_errors};
use crate::reconciler::applier::Applier;
use crate::reconciler::filesystem::{self, SourceState};
use crate::reconciler::parse::{self, ParseOptions};
use crate::reconciler::remediator::Remediator;
use crate::reconciler::status::StatusClient;

/// Maximum linear backoff multiplier for failed passes.
const MAX_BACKOFF: u32 = 12;

/// Timing knobs, from the container environment.
#[derive(Clone, Debug)]
pub struct OrchestratorTiming {
    /// Period between filesystem observations.
    pub polling_period: Duration,
    /// Period between status heartbeats (no-op writes are skipped).
    pub status_update_period: Duration,
    /// Base period for failed-pass retries.
    pub retry_period: Duration,
    /// Period between full resyncs regardless of commit movement.
    pub resync_period: Duration,
}

impl Default for OrchestratorTiming {
    fn default() -> Self {
        OrchestratorTiming {
            polling_period: Duration::from_secs(15),
            status_update_period: Duration::from_secs(15),
            retry_period: Duration::from_secs(60),
            resync_period: Duration::from_secs(3600),
        }
    }
}

/// The orchestrator for one sync.
pub struct Orchestrator<S: SyncApi> {
    pub client: Client,
    pub scope: Scope,
    pub sync_name: String,
    pub source_type: SourceType,
    /// `/repo/source`
    pub source_root: PathBuf,
    /// `/repo/hydrated`
    pub hydrated_root: PathBuf,
    /// Sync directory relative to the revision root.
    pub sync_dir: String,
    /// Name of the fetcher container (error attribution).
    pub source_container: String,
    pub rendering_enabled: bool,
    pub timing: OrchestratorTiming,
    pub status: Arc<StatusClient<S>>,
    pub applier: Applier,
    pub remediator: Arc<Remediator>,
    pub parse_opts: ParseOptions,
}

/// What one observation of the filesystem contract decided.
enum Observation {
    /// Nothing to do: commit unchanged and no forced resync.
    Unchanged,
    /// The hydrator has not finished the active commit yet.
    RenderingInProgress { commit: String },
    /// Ready to parse and apply from this directory.
    Ready {
        commit: String,
        read_dir: PathBuf,
        rendering_message: String,
    },
}

impl<S: SyncApi> Orchestrator<S> {
    /// Run the loop until the process is terminated.
    pub async fn run(mut self, mut conflict_rx: mpsc::Receiver<StatusError>) {
        let mut poll = tokio::time::interval(self.timing.polling_period);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut resync = tokio::time::interval(self.timing.resync_period);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.timing.status_update_period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval ticks fire immediately; consume them so startup
        // is driven by the poll timer like every later pass.
        resync.tick().await;
        heartbeat.tick().await;

        let mut last_synced: Option<String> = None;
        let mut backoff: u32 = 0;
        let mut skip_until = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if tokio::time::Instant::now() < skip_until {
                        continue;
                    }
                    let ok = self.run_once(&mut last_synced, false).await;
                    if ok {
                        backoff = 0;
                    } else {
                        backoff = (backoff + 1).min(MAX_BACKOFF);
                        skip_until = tokio::time::Instant::now()
                            + self.timing.retry_period * backoff;
                        debug!(backoff, "Scheduling retry");
                    }
                }
                _ = resync.tick() => {
                    info!("Periodic resync");
                    let ok = self.run_once(&mut last_synced, true).await;
                    if ok {
                        backoff = 0;
                    }
                }
                _ = heartbeat.tick() => {
                    // Re-assert the last successful sync status; the write
                    // is diff-checked, so this is a no-op unless something
                    // regressed it behind our back.
                    if let Some(key) = &last_synced
                        && let Some((_, commit)) = key.split_once(':')
                    {
                        let commit = commit.to_string();
                        if let Err(e) = self.status.set_sync_status(&commit, false, &[]).await {
                            debug!(error = %e, "Status heartbeat failed");
                        }
                    }
                }
                report = conflict_rx.recv() => {
                    let Some(report) = report else { break };
                    let mut reports = vec![report];
                    while let Ok(more) = conflict_rx.try_recv() {
                        reports.push(more);
                    }
                    if let Err(e) = self.status.prepend_conflict_errors(&reports).await {
                        warn!(error = %e, "Failed to record conflict reports");
                    }
                }
            }
        }
    }

    /// Observe the filesystem contract and decide what this pass does.
    fn observe(&self, last_synced: &Option<String>, force: bool) -> Result<Observation, StatusError> {
        let source = filesystem::source_state(
            &self.source_root,
            &self.sync_dir,
            &self.source_container,
        )?;
        let SourceState { commit, sync_dir } = source;
        let key = filesystem::done_key_for(self.source_type, &commit);

        if !self.rendering_enabled {
            if !force && last_synced.as_deref() == Some(key.as_str()) {
                return Ok(Observation::Unchanged);
            }
            return Ok(Observation::Ready {
                commit,
                read_dir: sync_dir,
                rendering_message: "Rendering not required".to_string(),
            });
        }

        // The hydrator records terminal attempts in the done file; absence
        // means rendering is still in progress for this commit.
        if filesystem::done_key(&self.hydrated_root) != key {
            return Ok(Observation::RenderingInProgress { commit });
        }

        if let Ok(Some(payload)) = filesystem::read_error_file(&self.hydrated_root) {
            let class = if payload.code == RenderingErrorClass::Actionable.code() {
                RenderingErrorClass::Actionable
            } else if payload.code == RenderingErrorClass::Transient.code() {
                RenderingErrorClass::Transient
            } else {
                RenderingErrorClass::Internal
            };
            return Err(StatusError::rendering(class, payload.error));
        }

        if !force && last_synced.as_deref() == Some(key.as_str()) {
            return Ok(Observation::Unchanged);
        }

        // A cleared hydrated root means the commit needed no rendering.
        match filesystem::resolve_rev(&self.hydrated_root) {
            Ok(rev_dir) => {
                let rendered_commit = filesystem::commit_of(&rev_dir).unwrap_or_default();
                if rendered_commit != commit {
                    // The hydrator is mid-swap; treat as in progress.
                    return Ok(Observation::RenderingInProgress { commit });
                }
                let read_dir = rev_dir.join(&self.sync_dir);
                Ok(Observation::Ready {
                    commit,
                    read_dir,
                    rendering_message: "Rendering succeeded".to_string(),
                })
            }
            Err(_) => Ok(Observation::Ready {
                commit,
                read_dir: sync_dir,
                rendering_message: "Rendering skipped".to_string(),
            }),
        }
    }

    /// One pass. Returns false when the pass should be retried with backoff.
    pub async fn run_once(&mut self, last_synced: &mut Option<String>, force: bool) -> bool {
        let observation = match self.observe(last_synced, force) {
            Ok(observation) => observation,
            Err(e) => {
                return self.surface_pre_apply_error(e).await;
            }
        };

        let (commit, read_dir, rendering_message) = match observation {
            Observation::Unchanged => {
                // Heartbeat: republishing identical status is a no-op write.
                return true;
            }
            Observation::RenderingInProgress { commit } => {
                debug!(commit = %commit, "Waiting for rendering");
                let _ = self
                    .status
                    .set_rendering_status(&commit, "Rendering in progress", &[])
                    .await;
                return true;
            }
            Observation::Ready {
                commit,
                read_dir,
                rendering_message,
            } => (commit, read_dir, rendering_message),
        };

        info!(commit = %commit, dir = %read_dir.display(), "Starting sync pass");
        if let Err(e) = self.status.set_source_status(&commit, &[]).await {
            warn!(error = %e, "Failed to write source status");
        }
        if let Err(e) = self
            .status
            .set_rendering_status(&commit, &rendering_message, &[])
            .await
        {
            warn!(error = %e, "Failed to write rendering status");
        }
        if let Err(e) = self.status.set_sync_status(&commit, true, &[]).await {
            warn!(error = %e, "Failed to write sync status");
        }

        // Parse and validate.
        let (objects, parse_errors) =
            parse::parse_source(&self.client, &self.parse_opts, &read_dir, &commit).await;
        if has_blocking_errors(&parse_errors) {
            error!(commit = %commit, errors = parse_errors.len(), "Blocking validation errors");
            // Validation halts the pipeline at its stage: surfaced on the
            // source condition, no apply happens.
            if let Err(e) = self.status.set_source_status(&commit, &parse_errors).await {
                warn!(error = %e, "Failed to write source status");
            }
            return false;
        }

        // Apply with the remediator paused; its watches resume against the
        // new declared set.
        self.remediator.pause();
        let result = self.applier.apply(&commit, objects.clone()).await;
        self.remediator.update_declared(&objects).await;
        self.remediator.resume();

        let mut errors = parse_errors;
        errors.extend(result.errors.iter().cloned());

        if let Err(e) = self.status.set_sync_status(&commit, false, &errors).await {
            warn!(error = %e, "Failed to write sync status");
            return false;
        }

        if errors.is_empty() {
            *last_synced = Some(filesystem::done_key_for(self.source_type, &commit));
            info!(commit = %commit, objects = result.applied.len(), "Sync pass succeeded");
            true
        } else {
            warn!(commit = %commit, errors = errors.len(), "Sync pass finished with errors");
            false
        }
    }

    /// Surface a source/rendering error observed before apply.
    ///
    /// Returns true when the error is not worth a retry backoff (the poll
    /// timer will pick up the fix as soon as the sidecars publish one).
    async fn surface_pre_apply_error(&self, err: StatusError) -> bool {
        match &err {
            StatusError::Rendering { .. } => {
                let commit = filesystem::resolve_rev(&self.source_root)
                    .ok()
                    .and_then(|d| filesystem::commit_of(&d))
                    .unwrap_or_default();
                if let Err(e) = self
                    .status
                    .set_rendering_status(&commit, "Rendering failed", &[err.clone()])
                    .await
                {
                    warn!(error = %e, "Failed to write rendering status");
                }
                true
            }
            StatusError::Transient { .. } => {
                debug!(error = %err, "Source not ready");
                true
            }
            _ => {
                let commit = filesystem::resolve_rev(&self.source_root)
                    .ok()
                    .and_then(|d| filesystem::commit_of(&d))
                    .unwrap_or_default();
                if let Err(e) = self.status.set_source_status(&commit, &[err.clone()]).await {
                    warn!(error = %e, "Failed to write source status");
                }
                true
            }
        }
    }
}
