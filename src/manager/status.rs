//! Manager-side status writes on sync objects.
//!
//! Writes are idempotent: the mutated status is diffed against the fetched
//! one ignoring timestamps, and unchanged statuses are not written. Each
//! successful write records the resulting resourceVersion so a stale cache
//! read can be recognized on the next reconcile.

use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::crd::{SyncApi, SyncStatus};
use crate::manager::FIELD_MANAGER;
use crate::manager::context::ManagerContext;
use crate::manager::error::{Error, Result};
use crate::manager::kstatus::WorkloadStatus;

/// Translate the worker Deployment status onto the sync's condition pair.
pub fn apply_workload_status(status: &mut SyncStatus, workload: &WorkloadStatus) {
    use crate::crd::SyncConditionType::{Reconciling, Stalled};
    match workload {
        WorkloadStatus::InProgress { message } => {
            status.set_reconciling("Deployment", message);
            status.clear_condition(Stalled);
        }
        WorkloadStatus::Failed { message } => {
            status.set_reconciling("Deployment", message);
            status.set_stalled("Deployment", message);
        }
        WorkloadStatus::Current => {
            status.clear_condition(Reconciling);
            status.clear_condition(Stalled);
        }
    }
}

/// Write the mutated sync status unless it is unchanged.
///
/// Returns whether a write happened.
pub async fn update_status<S: SyncApi>(
    ctx: &ManagerContext,
    api: &Api<S>,
    before: &S,
    after: &mut S,
) -> Result<bool> {
    after.sync_status_mut().observed_generation = after.meta().generation.unwrap_or(0);

    let unchanged = match before.sync_status() {
        Some(old) => old.equal_ignoring_timestamps(after.sync_status_mut()),
        None => false,
    };
    if unchanged {
        debug!(
            name = %after.name_any(),
            kind = S::sync_kind(),
            "Skipping no-op status update"
        );
        return Ok(false);
    }

    let name = after.name_any();
    let patch = serde_json::json!({
        "apiVersion": format!("{}/v1beta1", crate::crd::API_GROUP),
        "kind": S::sync_kind(),
        "status": after.sync_status_mut(),
    });
    let updated = api
        .patch_status(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&patch))
        .await
        .map_err(Error::Kube)?;

    let key = format!("{}/{}", S::sync_kind(), name);
    ctx.state
        .set_last_reconciled(key, updated.resource_version().unwrap_or_default());
    Ok(true)
}
