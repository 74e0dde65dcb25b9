//! The shared filesystem contract between the fetcher, the hydrator, and
//! the orchestrator.
//!
//! Layout inside the worker pod (all under `/repo`):
//!
//! ```text
//! source/<commit>/...    fetched tree, one dir per revision
//! source/rev             symlink -> the active revision dir
//! source/error.json      fetch error sentinel
//! hydrated/<commit>/...  rendered tree
//! hydrated/rev           symlink -> the active rendered dir
//! hydrated/error.json    rendering error sentinel
//! hydrated/done          "<sourceType>:<commit>" of the last terminal attempt
//! ```
//!
//! Producers swap `rev` atomically (symlink to a temp name, then rename);
//! consumers resolve the symlink and treat its basename as the commit.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crd::SourceType;
use crate::errors::StatusError;

/// Name of the symlink pointing at the active revision directory.
pub const REV_LINK: &str = "rev";
/// Temporary symlink name used for the atomic swap.
const TMP_LINK: &str = "tmp-link";
/// Name of the error sentinel file.
pub const ERROR_FILE: &str = "error.json";
/// Name of the hydrator's done file.
pub const DONE_FILE: &str = "done";

/// Payload of an error sentinel.
///
/// `args` is stripped before the payload reaches status: it can carry
/// volatile fields (retry counters) that would destabilize the fingerprint
/// notifications dedup on.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ErrorPayload {
    #[serde(rename = "Code", default)]
    pub code: String,
    #[serde(rename = "Error", default)]
    pub error: String,
    #[serde(rename = "Args", default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        ErrorPayload {
            code: code.into(),
            error: error.into(),
            args: None,
        }
    }

    /// Drop the unstable args field.
    pub fn stabilized(mut self) -> Self {
        self.args = None;
        self
    }
}

/// Atomically point `<root>/rev` at `new_dir`, removing the previously
/// linked directory when it changes.
pub fn update_symlink(root: &Path, new_dir: &Path) -> io::Result<()> {
    let link = root.join(REV_LINK);
    let tmp = root.join(TMP_LINK);

    let old_dir = match std::fs::read_link(&link) {
        Ok(target) => {
            let resolved = if target.is_absolute() {
                target
            } else {
                root.join(target)
            };
            if resolved == new_dir {
                return Ok(());
            }
            Some(resolved)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(new_dir, &tmp)?;
    std::fs::rename(&tmp, &link)?;

    if let Some(old) = old_dir
        && old.exists()
        && let Err(e) = std::fs::remove_dir_all(&old)
    {
        warn!(dir = %old.display(), error = %e, "Unable to remove previous revision directory");
    }
    Ok(())
}

/// Resolve the active revision directory behind `<root>/rev`.
pub fn resolve_rev(root: &Path) -> io::Result<PathBuf> {
    std::fs::canonicalize(root.join(REV_LINK))
}

/// The commit encoded in a revision directory path (its basename).
pub fn commit_of(dir: &Path) -> Option<String> {
    dir.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Write the error sentinel atomically (temp file + rename).
pub fn write_error_file(root: &Path, payload: &ErrorPayload) -> io::Result<()> {
    std::fs::create_dir_all(root)?;
    let tmp = root.join(format!(".tmp-{ERROR_FILE}"));
    let body = serde_json::to_vec(payload).map_err(io::Error::other)?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, root.join(ERROR_FILE))
}

/// Remove the error sentinel if present.
pub fn clear_error_file(root: &Path) -> io::Result<()> {
    match std::fs::remove_file(root.join(ERROR_FILE)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read and stabilize the error sentinel, if present.
pub fn read_error_file(root: &Path) -> io::Result<Option<ErrorPayload>> {
    match std::fs::read(root.join(ERROR_FILE)) {
        Ok(bytes) => {
            let payload: ErrorPayload = serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| ErrorPayload::new("", String::from_utf8_lossy(&bytes)));
            Ok(Some(payload.stabilized()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Record a terminal rendering attempt for a commit.
///
/// The key is scoped by source type: a git SHA and an OCI digest that
/// happen to collide after a source-type switch must not be mistaken for
/// an already-processed commit.
pub fn write_done_file(root: &Path, source_type: SourceType, commit: &str) -> io::Result<()> {
    std::fs::create_dir_all(root)?;
    std::fs::write(root.join(DONE_FILE), format!("{source_type}:{commit}"))
}

/// The `<sourceType>:<commit>` recorded by the last terminal attempt, or ""
/// when no attempt completed yet.
pub fn done_key(root: &Path) -> String {
    match std::fs::read_to_string(root.join(DONE_FILE)) {
        Ok(content) => content.trim().to_string(),
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(error = %e, "Unable to read done file");
            }
            String::new()
        }
    }
}

/// Build the done key for comparison against [`done_key`].
pub fn done_key_for(source_type: SourceType, commit: &str) -> String {
    format!("{source_type}:{commit}")
}

/// Remove the done file; a new rendering pass is starting.
pub fn clear_done_file(root: &Path) -> io::Result<()> {
    match std::fs::remove_file(root.join(DONE_FILE)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Observation of the source side of the contract from the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceState {
    /// Active commit (basename of the resolved rev dir).
    pub commit: String,
    /// Absolute path of the sync directory within the active revision.
    pub sync_dir: PathBuf,
}

/// Read the fetcher's side of the contract: the active commit and the sync
/// directory within it.
///
/// An absent mount is transient (the sidecar may still be starting); an
/// error sentinel is a source error; an unreadable symlink is a source
/// error too (the fetcher has not produced a revision yet).
pub fn source_state(
    source_root: &Path,
    sync_dir: &str,
    container: &str,
) -> Result<SourceState, StatusError> {
    if !source_root.exists() {
        return Err(StatusError::transient(format!(
            "source root {} is not yet mounted",
            source_root.display()
        )));
    }

    match read_error_file(source_root) {
        Ok(Some(payload)) => {
            return Err(StatusError::source(format!(
                "error in the {container} container: {}",
                serde_json::to_string(&payload).unwrap_or(payload.error)
            )));
        }
        Ok(None) => {}
        Err(e) => {
            return Err(StatusError::transient(format!(
                "unable to load {}: {e}",
                source_root.join(ERROR_FILE).display()
            )));
        }
    }

    let rev_dir = resolve_rev(source_root).map_err(|e| {
        StatusError::source(format!(
            "unable to evaluate the source link {}: {e}",
            source_root.join(REV_LINK).display()
        ))
    })?;
    let commit = commit_of(&rev_dir).ok_or_else(|| {
        StatusError::internal(format!(
            "source revision path {} has no basename",
            rev_dir.display()
        ))
    })?;

    let sync_path = rev_dir.join(sync_dir);
    let sync_path = std::fs::canonicalize(&sync_path).map_err(|e| {
        StatusError::source(format!(
            "sync directory {} does not exist in revision {commit}: {e}",
            sync_path.display()
        ))
    })?;

    Ok(SourceState {
        commit,
        sync_dir: sync_path,
    })
}
