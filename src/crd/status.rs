//! Shared status types for RootSync and RepoSync.
//!
//! The status carries three pipeline stage blocks (source, rendering, sync),
//! each with its own commit, error list, and size-aware error summary, plus
//! the Reconciling/Stalled/Syncing condition trio maintained by the manager
//! and the reconciler.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single pipeline error surfaced in status.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSyncError {
    /// Stable error code, e.g. `KNV2004`.
    pub code: String,
    /// Human-readable message.
    pub error_message: String,
}

impl ConfigSyncError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            error_message: message.into(),
        }
    }
}

/// Size-aware summary of an error list, preserved across truncation.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    /// Count before truncation.
    #[serde(default)]
    pub total_count: i32,
    /// Whether the error list was truncated to fit the object size limit.
    #[serde(default)]
    pub truncated: bool,
    /// Count retained after truncation.
    #[serde(default)]
    pub error_count_after_truncation: i32,
}

impl ErrorSummary {
    /// Merge another summary into this one.
    pub fn merge(&mut self, other: &ErrorSummary) {
        self.total_count += other.total_count;
        self.error_count_after_truncation += other.error_count_after_truncation;
        if other.truncated {
            self.truncated = true;
        }
    }
}

/// Git sub-block reported in stage statuses.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitSourceStatus {
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

/// OCI sub-block reported in stage statuses.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OciSourceStatus {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

/// Helm sub-block reported in stage statuses.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmSourceStatus {
    pub repo: String,
    pub chart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Status of the fetch stage.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    /// Revision most recently observed from the fetcher.
    #[serde(default)]
    pub commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciSourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmSourceStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ConfigSyncError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<ErrorSummary>,
    /// RFC 3339 timestamp of the last write to this block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

/// Status of the rendering stage.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RenderingStatus {
    #[serde(default)]
    pub commit: String,
    /// Short progress message, e.g. "Rendering skipped" or "Rendering succeeded".
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciSourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmSourceStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ConfigSyncError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<ErrorSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

/// Status of the apply stage.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusBlock {
    #[serde(default)]
    pub commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciSourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmSourceStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ConfigSyncError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<ErrorSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

/// Condition types maintained on sync objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SyncConditionType {
    /// The manager is still shaping the worker deployment.
    Reconciling,
    /// A permanent error blocks progress until the spec changes.
    Stalled,
    /// The reconciler is between observing a new commit and a clean apply.
    Syncing,
}

impl std::fmt::Display for SyncConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncConditionType::Reconciling => write!(f, "Reconciling"),
            SyncConditionType::Stalled => write!(f, "Stalled"),
            SyncConditionType::Syncing => write!(f, "Syncing"),
        }
    }
}

/// Which stage contributed errors referenced by the Syncing condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ErrorSource {
    SourceError,
    RenderingError,
    SyncError,
}

/// One condition entry on a sync object.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncCondition {
    pub r#type: SyncConditionType,
    /// "True", "False", or "Unknown".
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// Commit the condition refers to (Syncing only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Stages referenced by this condition's errors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_source_refs: Vec<ErrorSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<ErrorSummary>,
    pub last_transition_time: String,
    pub last_update_time: String,
}

/// Status shared by RootSync and RepoSync.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Generation of the spec most recently acted on.
    #[serde(default)]
    pub observed_generation: i64,

    /// Revision most recently applied with zero sync errors. Never regresses.
    #[serde(default)]
    pub last_synced_commit: String,

    /// Name of the worker deployment serving this sync.
    #[serde(default)]
    pub reconciler: String,

    #[serde(default)]
    pub source: SourceStatus,

    #[serde(default)]
    pub rendering: RenderingStatus,

    #[serde(default)]
    pub sync: SyncStatusBlock,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SyncCondition>,
}

fn now_rfc3339() -> String {
    jiff::Timestamp::now().to_string()
}

impl SyncStatus {
    fn find(&mut self, t: SyncConditionType) -> Option<&mut SyncCondition> {
        self.conditions.iter_mut().find(|c| c.r#type == t)
    }

    /// Insert or update a condition, preserving the transition time when the
    /// status value did not change.
    fn upsert_condition(&mut self, mut cond: SyncCondition) {
        match self.find(cond.r#type) {
            Some(existing) => {
                if existing.status == cond.status {
                    cond.last_transition_time = existing.last_transition_time.clone();
                }
                *existing = cond;
            }
            None => self.conditions.push(cond),
        }
    }

    /// Set `Reconciling=True` while the worker deployment is being shaped.
    pub fn set_reconciling(&mut self, reason: &str, message: &str) {
        let now = now_rfc3339();
        self.upsert_condition(SyncCondition {
            r#type: SyncConditionType::Reconciling,
            status: "True".into(),
            reason: reason.into(),
            message: message.into(),
            commit: None,
            error_source_refs: Vec::new(),
            error_summary: None,
            last_transition_time: now.clone(),
            last_update_time: now,
        });
    }

    /// Set `Stalled=True` with a permanent error.
    pub fn set_stalled(&mut self, reason: &str, message: &str) {
        let now = now_rfc3339();
        self.upsert_condition(SyncCondition {
            r#type: SyncConditionType::Stalled,
            status: "True".into(),
            reason: reason.into(),
            message: message.into(),
            commit: None,
            error_source_refs: Vec::new(),
            error_summary: None,
            last_transition_time: now.clone(),
            last_update_time: now,
        });
    }

    /// Set the `Syncing` condition for a pipeline stage.
    #[allow(clippy::too_many_arguments)]
    pub fn set_syncing(
        &mut self,
        syncing: bool,
        reason: &str,
        message: &str,
        commit: &str,
        error_sources: Vec<ErrorSource>,
        error_summary: ErrorSummary,
        last_update: &str,
    ) {
        self.upsert_condition(SyncCondition {
            r#type: SyncConditionType::Syncing,
            status: if syncing { "True".into() } else { "False".into() },
            reason: reason.into(),
            message: message.into(),
            commit: Some(commit.into()),
            error_source_refs: error_sources,
            error_summary: Some(error_summary),
            last_transition_time: now_rfc3339(),
            last_update_time: last_update.into(),
        });
    }

    /// Remove a condition if present.
    pub fn clear_condition(&mut self, t: SyncConditionType) {
        self.conditions.retain(|c| c.r#type != t);
    }

    /// Whether a condition is present with status "True".
    pub fn condition_true(&self, t: SyncConditionType) -> bool {
        self.conditions
            .iter()
            .any(|c| c.r#type == t && c.status == "True")
    }

    /// Record the commit currently moving through the pipeline on all three
    /// stage blocks' shared view.
    pub fn set_last_commit(&mut self, commit: &str) {
        self.sync.commit = commit.to_string();
    }

    /// Returns true when the two statuses are equal ignoring timestamp-only
    /// differences. Used to skip no-op status writes.
    pub fn equal_ignoring_timestamps(&self, other: &SyncStatus) -> bool {
        let strip = |s: &SyncStatus| {
            let mut s = s.clone();
            s.source.last_update = None;
            s.rendering.last_update = None;
            s.sync.last_update = None;
            for c in &mut s.conditions {
                c.last_transition_time = String::new();
                c.last_update_time = String::new();
            }
            s
        };
        strip(self) == strip(other)
    }
}

/// Summarize source + sync errors into condition refs and a merged summary.
pub fn summarize_errors(
    source: &SourceStatus,
    sync: &SyncStatusBlock,
) -> (Vec<ErrorSource>, ErrorSummary) {
    let mut sources = Vec::new();
    if !source.errors.is_empty() {
        sources.push(ErrorSource::SourceError);
    }
    if !sync.errors.is_empty() {
        sources.push(ErrorSource::SyncError);
    }

    let mut summary = ErrorSummary::default();
    for s in [&source.error_summary, &sync.error_summary].into_iter().flatten() {
        summary.merge(s);
    }
    (sources, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_preserves_transition_time_on_same_status() {
        let mut status = SyncStatus::default();
        status.set_reconciling("Deployment", "creating");
        let first = status.conditions[0].last_transition_time.clone();
        status.set_reconciling("Deployment", "still creating");
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, first);
        assert_eq!(status.conditions[0].message, "still creating");
    }

    #[test]
    fn equal_ignoring_timestamps() {
        let mut a = SyncStatus::default();
        let mut b = SyncStatus::default();
        a.source.last_update = Some("2026-01-01T00:00:00Z".into());
        b.source.last_update = Some("2026-01-02T00:00:00Z".into());
        assert!(a.equal_ignoring_timestamps(&b));
        b.source.commit = "abc".into();
        assert!(!a.equal_ignoring_timestamps(&b));
    }

    #[test]
    fn summarize_merges_stage_summaries() {
        let source = SourceStatus {
            errors: vec![ConfigSyncError::new("KNV2004", "fetch failed")],
            error_summary: Some(ErrorSummary {
                total_count: 1,
                truncated: false,
                error_count_after_truncation: 1,
            }),
            ..Default::default()
        };
        let sync = SyncStatusBlock {
            error_summary: Some(ErrorSummary {
                total_count: 3,
                truncated: true,
                error_count_after_truncation: 1,
            }),
            ..Default::default()
        };
        let (refs, summary) = summarize_errors(&source, &sync);
        assert_eq!(refs, vec![ErrorSource::SourceError]);
        assert_eq!(summary.total_count, 4);
        assert!(summary.truncated);
    }
}
