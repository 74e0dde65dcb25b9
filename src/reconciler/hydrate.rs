//! Hydration controller: renders the fetched source tree and publishes the
//! result through the hydrated side of the filesystem contract.
//!
//! Each pass is keyed by source commit and moves through
//! `Pending -> Rendering -> Done{success|error}`; the done file records the
//! terminal attempt so a commit is rendered at most once. The run timer
//! picks up new commits; the rehydrate timer retries only while an error
//! sentinel is present. A commit that changes mid-render discards the
//! partial output as transient and leaves the retry to the next pass.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::crd::SourceType;
use crate::errors::RenderingErrorClass;
use crate::reconciler::filesystem::{
    self, ErrorPayload, clear_done_file, clear_error_file, done_key, done_key_for,
    write_done_file, write_error_file,
};

/// Renderer config file names recognized at the sync directory.
const RENDERER_CONFIG_FILES: [&str; 3] = ["kustomization.yaml", "kustomization.yml", "Kustomization"];

/// A rendering failure with its classification.
#[derive(Debug, Clone, PartialEq)]
pub struct HydrationError {
    pub class: RenderingErrorClass,
    pub message: String,
}

impl HydrationError {
    fn actionable(message: impl Into<String>) -> Self {
        HydrationError {
            class: RenderingErrorClass::Actionable,
            message: message.into(),
        }
    }

    fn transient(message: impl Into<String>) -> Self {
        HydrationError {
            class: RenderingErrorClass::Transient,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        HydrationError {
            class: RenderingErrorClass::Internal,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HydrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// The hydration process for one worker.
pub struct Hydrator {
    pub source_type: SourceType,
    /// Root of the fetched tree (`/repo/source`).
    pub source_root: PathBuf,
    /// Root of the rendered tree (`/repo/hydrated`).
    pub hydrated_root: PathBuf,
    /// Sync directory relative to the source revision.
    pub sync_dir: String,
    /// Period between checks for a new commit to render.
    pub polling_period: Duration,
    /// Period between retries while an error sentinel is present.
    pub rehydrate_period: Duration,
    /// Name of the fetcher container, for error attribution.
    pub source_container: String,
    /// Allow exec-style renderer plugins (shell image variants only).
    pub enable_shell: bool,
}

impl Hydrator {
    /// Run the two timers forever.
    pub async fn run(&self) {
        let mut run_timer = tokio::time::interval(self.polling_period);
        run_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut rehydrate_timer = tokio::time::interval(self.rehydrate_period);
        rehydrate_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = run_timer.tick() => self.run_once().await,
                _ = rehydrate_timer.tick() => self.rehydrate_on_error().await,
            }
        }
    }

    /// One pass of the run timer: render when a new commit is observed.
    pub async fn run_once(&self) {
        let state = match filesystem::source_state(
            &self.source_root,
            &self.sync_dir,
            &self.source_container,
        ) {
            Ok(state) => state,
            Err(e) => {
                debug!(error = %e, "Source not ready for rendering");
                return;
            }
        };

        if done_key(&self.hydrated_root) == done_key_for(self.source_type, &state.commit) {
            // Terminal attempt already recorded for this commit; only the
            // rehydrate timer retries failures.
            return;
        }

        let result = self.hydrate(&state.commit, &state.sync_dir).await;
        self.complete(&state.commit, result);
    }

    /// One pass of the rehydrate timer: retry only while an error sentinel
    /// is present.
    pub async fn rehydrate_on_error(&self) {
        match filesystem::read_error_file(&self.hydrated_root) {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Unable to check rendering error sentinel");
                return;
            }
        }
        let state = match filesystem::source_state(
            &self.source_root,
            &self.sync_dir,
            &self.source_container,
        ) {
            Ok(state) => state,
            Err(e) => {
                debug!(error = %e, "Source not ready for re-rendering");
                return;
            }
        };
        info!(commit = %state.commit, "Retrying rendering");
        // Re-evaluate from scratch: the retried commit may no longer need
        // rendering at all (e.g. the config file was the problem).
        let result = self.hydrate(&state.commit, &state.sync_dir).await;
        self.complete(&state.commit, result);
    }

    /// Decide whether the commit needs rendering and run the renderer.
    async fn hydrate(&self, commit: &str, sync_dir: &Path) -> Result<(), HydrationError> {
        let needs_render = has_renderer_config(sync_dir);
        if !needs_render {
            if let Some(nested) = renderer_config_in_descendant(sync_dir) {
                return Err(HydrationError::actionable(format!(
                    "Rendering config found at {} but not at the sync directory {}. \
                     To fix, either add a kustomization.yaml at the sync directory to \
                     trigger rendering, or remove it from all subdirectories to skip rendering.",
                    nested.display(),
                    sync_dir.display()
                )));
            }
            debug!(commit = %commit, "No renderer config, clearing hydrated root");
            if self.hydrated_root.exists()
                && let Err(e) = std::fs::remove_dir_all(&self.hydrated_root)
            {
                return Err(HydrationError::internal(format!(
                    "unable to clear the hydrated root: {e}"
                )));
            }
            return Ok(());
        }

        // A new attempt is starting; consumers treat an absent done file as
        // "in progress" and skip.
        if let Err(e) = clear_done_file(&self.hydrated_root) {
            return Err(HydrationError::internal(format!(
                "unable to remove the done file: {e}"
            )));
        }
        self.render(commit, sync_dir).await
    }

    /// Run the renderer into the per-commit output dir and swap the symlink.
    async fn render(&self, commit: &str, sync_dir: &Path) -> Result<(), HydrationError> {
        let out_dir = self.hydrated_root.join(commit).join(&self.sync_dir);
        if let Err(e) = std::fs::create_dir_all(&out_dir) {
            return Err(HydrationError::internal(format!(
                "unable to create output directory {}: {e}",
                out_dir.display()
            )));
        }

        let mut cmd = Command::new("kustomize");
        cmd.arg("build")
            .arg(sync_dir)
            .arg("--output")
            .arg(&out_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.enable_shell {
            cmd.args(["--enable-alpha-plugins", "--enable-exec"]);
        }
        let output = cmd.output().await.map_err(|e| {
            HydrationError::transient(format!("unable to run kustomize: {e}"))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HydrationError::actionable(format!(
                "kustomize build failed: {}",
                stderr.trim()
            )));
        }

        // If the fetcher advanced the commit while we rendered, the output
        // belongs to a revision that no longer exists. Discard and retry.
        let current = filesystem::resolve_rev(&self.source_root)
            .ok()
            .and_then(|d| filesystem::commit_of(&d));
        if current.as_deref() != Some(commit) {
            let _ = std::fs::remove_dir_all(self.hydrated_root.join(commit));
            return Err(HydrationError::transient(format!(
                "source commit changed while rendering, was {commit}, now {}. \
                 It will be retried in the next sync",
                current.unwrap_or_default()
            )));
        }

        filesystem::update_symlink(&self.hydrated_root, &self.hydrated_root.join(commit))
            .map_err(|e| {
                HydrationError::internal(format!("unable to update the hydrated symlink: {e}"))
            })?;
        info!(commit = %commit, "Rendering succeeded");
        Ok(())
    }

    /// Record the terminal attempt: write or clear the error sentinel and
    /// stamp the done file.
    fn complete(&self, commit: &str, result: Result<(), HydrationError>) {
        let write_result = match &result {
            Ok(()) => clear_error_file(&self.hydrated_root),
            Err(e) => {
                error!(commit = %commit, class = ?e.class, error = %e, "Rendering failed");
                write_error_file(
                    &self.hydrated_root,
                    &ErrorPayload::new(e.class.code(), e.message.clone()),
                )
            }
        };
        if let Err(e) = write_result {
            warn!(commit = %commit, error = %e, "Unable to update rendering error sentinel");
            return;
        }

        // Transient errors do not mark the commit done: the run timer should
        // pick it up again, not just the rehydrate timer.
        if let Err(HydrationError {
            class: RenderingErrorClass::Transient,
            ..
        }) = &result
        {
            return;
        }

        if let Err(e) = write_done_file(&self.hydrated_root, self.source_type, commit) {
            warn!(commit = %commit, error = %e, "Unable to write done file");
        }
    }
}

/// Whether a renderer config file sits at the sync directory itself.
pub fn has_renderer_config(dir: &Path) -> bool {
    RENDERER_CONFIG_FILES.iter().any(|f| dir.join(f).is_file())
}

/// Find a renderer config below (but not at) the sync directory.
pub fn renderer_config_in_descendant(dir: &Path) -> Option<PathBuf> {
    for entry in walkdir::WalkDir::new(dir)
        .min_depth(2)
        .into_iter()
        .filter_map(Result::ok)
    {
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_file() && RENDERER_CONFIG_FILES.contains(&name.as_ref()) {
            return Some(entry.path().to_path_buf());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::codes;
    use tempfile::TempDir;

    fn hydrator(source_root: &Path, hydrated_root: &Path) -> Hydrator {
        Hydrator {
            source_type: SourceType::Git,
            source_root: source_root.to_path_buf(),
            hydrated_root: hydrated_root.to_path_buf(),
            sync_dir: "acme".into(),
            polling_period: Duration::from_secs(5),
            rehydrate_period: Duration::from_secs(30),
            source_container: "git-sync".into(),
            enable_shell: false,
        }
    }

    fn stage_commit(source_root: &Path, commit: &str) -> PathBuf {
        let rev = source_root.join(commit);
        let sync = rev.join("acme");
        std::fs::create_dir_all(&sync).unwrap();
        filesystem::update_symlink(source_root, &rev).unwrap();
        sync
    }

    #[test]
    fn renderer_config_detection() {
        let tmp = TempDir::new().unwrap();
        assert!(!has_renderer_config(tmp.path()));
        std::fs::write(tmp.path().join("kustomization.yaml"), "resources: []\n").unwrap();
        assert!(has_renderer_config(tmp.path()));
    }

    #[test]
    fn nested_renderer_config_is_found() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("base");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("kustomization.yaml"), "resources: []\n").unwrap();
        assert!(!has_renderer_config(tmp.path()));
        let found = renderer_config_in_descendant(tmp.path()).unwrap();
        assert!(found.ends_with("base/kustomization.yaml"));
    }

    #[tokio::test]
    async fn no_renderer_config_clears_hydrated_root_and_marks_done() {
        let source = TempDir::new().unwrap();
        let hydrated = TempDir::new().unwrap();
        let hydrated_root = hydrated.path().join("hydrated");
        std::fs::create_dir_all(&hydrated_root).unwrap();

        stage_commit(source.path(), "abc123");
        let h = hydrator(source.path(), &hydrated_root);
        h.run_once().await;

        assert_eq!(done_key(&hydrated_root), "git:abc123");
        assert!(filesystem::read_error_file(&hydrated_root).unwrap().is_none());
    }

    #[tokio::test]
    async fn misplaced_renderer_config_is_actionable() {
        let source = TempDir::new().unwrap();
        let hydrated = TempDir::new().unwrap();
        let hydrated_root = hydrated.path().join("hydrated");

        let sync = stage_commit(source.path(), "abc123");
        let nested = sync.join("overlay");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("kustomization.yaml"), "resources: []\n").unwrap();

        let h = hydrator(source.path(), &hydrated_root);
        h.run_once().await;

        let err = filesystem::read_error_file(&hydrated_root).unwrap().unwrap();
        assert_eq!(err.code, RenderingErrorClass::Actionable.code());
        // A terminal attempt was recorded; the run timer will not re-render
        // this commit.
        assert_eq!(done_key(&hydrated_root), "git:abc123");
    }

    #[tokio::test]
    async fn done_commit_is_not_reprocessed() {
        let source = TempDir::new().unwrap();
        let hydrated = TempDir::new().unwrap();
        let hydrated_root = hydrated.path().join("hydrated");
        std::fs::create_dir_all(&hydrated_root).unwrap();

        stage_commit(source.path(), "abc123");
        write_done_file(&hydrated_root, SourceType::Git, "abc123").unwrap();
        // Plant an error file; run_once must not touch it for a done commit.
        write_error_file(&hydrated_root, &ErrorPayload::new(codes::ACTIONABLE_RENDERING, "old"))
            .unwrap();

        let h = hydrator(source.path(), &hydrated_root);
        h.run_once().await;
        let err = filesystem::read_error_file(&hydrated_root).unwrap().unwrap();
        assert_eq!(err.error, "old");
    }
}
