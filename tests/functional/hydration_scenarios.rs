//! Hydration state machine over a temp filesystem.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sync_operator::crd::SourceType;
use sync_operator::errors::{RenderingErrorClass, codes};
use sync_operator::reconciler::filesystem::{
    self, ErrorPayload, done_key, update_symlink, write_error_file,
};
use sync_operator::reconciler::hydrate::Hydrator;
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
    update_symlink(source_root, &rev).unwrap();
    sync
}

/// Each commit gets exactly one terminal attempt; a new commit starts a
/// fresh state and clears the previous error.
#[tokio::test]
async fn new_commit_supersedes_failed_commit() {
    let source = TempDir::new().unwrap();
    let hydrated = TempDir::new().unwrap();
    let hydrated_root = hydrated.path().join("hydrated");

    // Commit 1 fails: renderer config only in a subdirectory.
    let sync = stage_commit(source.path(), "commit-1");
    std::fs::create_dir_all(sync.join("base")).unwrap();
    std::fs::write(sync.join("base/kustomization.yaml"), "resources: []\n").unwrap();

    let h = hydrator(source.path(), &hydrated_root);
    h.run_once().await;
    let err = filesystem::read_error_file(&hydrated_root).unwrap().unwrap();
    assert_eq!(err.code, RenderingErrorClass::Actionable.code());
    assert_eq!(done_key(&hydrated_root), "git:commit-1");

    // Re-running for the same commit does not attempt again.
    h.run_once().await;
    assert_eq!(done_key(&hydrated_root), "git:commit-1");

    // Commit 2 (force-push revert) has no renderer config anywhere; it
    // succeeds, clearing the error sentinel.
    stage_commit(source.path(), "commit-2");
    h.run_once().await;
    assert_eq!(done_key(&hydrated_root), "git:commit-2");
    assert!(filesystem::read_error_file(&hydrated_root).unwrap().is_none());
}

/// The rehydrate timer only acts while an error sentinel is present.
#[tokio::test]
async fn rehydrate_is_error_gated() {
    let source = TempDir::new().unwrap();
    let hydrated = TempDir::new().unwrap();
    let hydrated_root = hydrated.path().join("hydrated");
    std::fs::create_dir_all(&hydrated_root).unwrap();

    stage_commit(source.path(), "commit-1");
    let h = hydrator(source.path(), &hydrated_root);

    // No error sentinel: rehydrate is a no-op, nothing gets marked done.
    h.rehydrate_on_error().await;
    assert_eq!(done_key(&hydrated_root), "");

    // With a sentinel planted, rehydrate runs a fresh attempt. The commit
    // needs no rendering, so the retry succeeds and clears the sentinel.
    write_error_file(&hydrated_root, &ErrorPayload::new(codes::TRANSIENT, "flake")).unwrap();
    h.rehydrate_on_error().await;
    assert!(filesystem::read_error_file(&hydrated_root).unwrap().is_none());
    assert_eq!(done_key(&hydrated_root), "git:commit-1");
}

/// The orchestrator-facing source contract: sentinel wins over symlink.
#[test]
fn source_state_precedence() {
    let source = TempDir::new().unwrap();
    stage_commit(source.path(), "abc123");

    let ok = filesystem::source_state(source.path(), "acme", "git-sync").unwrap();
    assert_eq!(ok.commit, "abc123");

    write_error_file(source.path(), &ErrorPayload::new(codes::SOURCE, "bad credentials")).unwrap();
    let err = filesystem::source_state(source.path(), "acme", "git-sync").unwrap_err();
    assert!(err.to_string().contains("bad credentials"));

    filesystem::clear_error_file(source.path()).unwrap();
    assert!(filesystem::source_state(source.path(), "acme", "git-sync").is_ok());
}
