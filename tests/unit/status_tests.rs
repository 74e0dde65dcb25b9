//! Condition and error-summary behavior on sync status.

use sync_operator::crd::status::ErrorSource;
use sync_operator::crd::{
    ConfigSyncError, ErrorSummary, SyncConditionType, SyncStatus,
};

fn summary(total: i32) -> ErrorSummary {
    ErrorSummary {
        total_count: total,
        truncated: false,
        error_count_after_truncation: total,
    }
}

#[test]
fn syncing_condition_carries_commit_and_error_sources() {
    let mut status = SyncStatus::default();
    status.set_syncing(
        true,
        "Source",
        "Source",
        "abc123",
        vec![ErrorSource::SourceError],
        summary(2),
        "2026-01-01T00:00:00Z",
    );
    let cond = status
        .conditions
        .iter()
        .find(|c| c.r#type == SyncConditionType::Syncing)
        .expect("syncing condition");
    assert_eq!(cond.status, "True");
    assert_eq!(cond.commit.as_deref(), Some("abc123"));
    assert_eq!(cond.error_source_refs, vec![ErrorSource::SourceError]);
    assert_eq!(cond.error_summary.as_ref().unwrap().total_count, 2);
}

#[test]
fn syncing_false_transitions_with_fresh_transition_time() {
    let mut status = SyncStatus::default();
    status.set_syncing(true, "Sync", "Syncing", "abc", vec![], summary(0), "t1");
    status.set_syncing(false, "Sync", "Sync Completed", "abc", vec![], summary(0), "t2");
    assert!(!status.condition_true(SyncConditionType::Syncing));
    assert_eq!(status.conditions.len(), 1);
}

#[test]
fn stalled_and_reconciling_coexist() {
    let mut status = SyncStatus::default();
    status.set_reconciling("Deployment", "rolling out");
    status.set_stalled("Deployment", "progress deadline exceeded");
    assert!(status.condition_true(SyncConditionType::Reconciling));
    assert!(status.condition_true(SyncConditionType::Stalled));

    status.clear_condition(SyncConditionType::Stalled);
    assert!(!status.condition_true(SyncConditionType::Stalled));
    assert!(status.condition_true(SyncConditionType::Reconciling));
}

#[test]
fn error_summary_merge_accumulates() {
    let mut merged = ErrorSummary::default();
    merged.merge(&summary(2));
    merged.merge(&ErrorSummary {
        total_count: 5,
        truncated: true,
        error_count_after_truncation: 1,
    });
    assert_eq!(merged.total_count, 7);
    assert!(merged.truncated);
    assert_eq!(merged.error_count_after_truncation, 3);
}

#[test]
fn config_sync_error_shape() {
    let err = ConfigSyncError::new("KNV2004", "fetch failed");
    let json = serde_json::to_value(&err).unwrap();
    assert_eq!(json["code"], "KNV2004");
    assert_eq!(json["errorMessage"], "fetch failed");
}
