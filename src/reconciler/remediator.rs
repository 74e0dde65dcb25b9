//! Remediator: watches declared GroupKinds and reverts drift between
//! apply passes.
//!
//! One watcher per declared GroupKind, restricted to the sync's scope and
//! to managed objects. Drift on a declared field is re-applied from the
//! declared version; deletion of a managed object re-creates it; a foreign
//! manager on a declared object produces a management-conflict report sent
//! to the orchestrator over a bounded channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crd::Scope;
use crate::errors::StatusError;
use crate::fieldpath;
use crate::metadata::{self, ObjectId};
use crate::reconciler::applier::api_resource_of;

/// Capacity of the conflict-report channel; reports beyond it are dropped
/// (they are re-detected on the next watch event).
const CONFLICT_CHANNEL_CAPACITY: usize = 128;

/// Key identifying one watcher: group + kind.
type GroupKind = (String, String);

struct DeclaredSet {
    /// Declared objects by identity, as stamped by the parser.
    objects: BTreeMap<ObjectId, DynamicObject>,
    /// ApiResource per group-kind, for watcher construction.
    resources: BTreeMap<GroupKind, ApiResource>,
}

/// The remediator for one sync.
pub struct Remediator {
    client: Client,
    scope: Scope,
    sync_name: String,
    /// Field manager used for corrective applies.
    field_manager: String,
    declared: RwLock<Arc<DeclaredSet>>,
    paused: AtomicBool,
    conflict_tx: mpsc::Sender<StatusError>,
    watchers: tokio::sync::Mutex<HashMap<GroupKind, JoinHandle<()>>>,
}

impl Remediator {
    /// Create the remediator and the receiving end of its conflict reports.
    pub fn new(
        client: Client,
        scope: Scope,
        sync_name: String,
        reconciler: String,
    ) -> (Arc<Remediator>, mpsc::Receiver<StatusError>) {
        let (conflict_tx, conflict_rx) = mpsc::channel(CONFLICT_CHANNEL_CAPACITY);
        let remediator = Arc::new(Remediator {
            client,
            scope,
            sync_name,
            field_manager: reconciler,
            declared: RwLock::new(Arc::new(DeclaredSet {
                objects: BTreeMap::new(),
                resources: BTreeMap::new(),
            })),
            paused: AtomicBool::new(true),
            conflict_tx,
            watchers: tokio::sync::Mutex::new(HashMap::new()),
        });
        (remediator, conflict_rx)
    }

    /// Pause event handling while the applier runs.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume event handling after an apply pass.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Replace the declared set after a successful apply and reconcile the
    /// watcher set against the new GroupKinds.
    pub async fn update_declared(self: &Arc<Self>, objects: &[DynamicObject]) {
        let mut declared = BTreeMap::new();
        let mut resources = BTreeMap::new();
        for obj in objects {
            let Some(id) = ObjectId::of(obj) else { continue };
            if let Ok(resource) = api_resource_of(obj) {
                resources.insert((id.group.clone(), id.kind.clone()), resource);
            }
            declared.insert(id, obj.clone());
        }
        let new_set = Arc::new(DeclaredSet {
            objects: declared,
            resources,
        });
        *self.declared.write().await = new_set.clone();

        let mut watchers = self.watchers.lock().await;
        // Drop watchers for kinds no longer declared.
        watchers.retain(|gk, handle| {
            if new_set.resources.contains_key(gk) {
                true
            } else {
                debug!(group = %gk.0, kind = %gk.1, "Stopping watcher for undeclared kind");
                handle.abort();
                false
            }
        });
        // Start watchers for newly declared kinds.
        for (gk, resource) in &new_set.resources {
            if watchers.contains_key(gk) {
                continue;
            }
            info!(group = %gk.0, kind = %gk.1, "Starting drift watcher");
            let handle = tokio::spawn(watch_group_kind(self.clone(), resource.clone()));
            watchers.insert(gk.clone(), handle);
        }
    }

    fn scoped_api(&self, resource: &ApiResource) -> Api<DynamicObject> {
        match &self.scope {
            Scope::Root => Api::all_with(self.client.clone(), resource),
            Scope::Namespace(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
        }
    }

    fn manager(&self) -> String {
        self.scope.manager(&self.sync_name)
    }

    /// Handle one watch event for a (possibly) managed object.
    pub async fn handle_change(&self, live: &DynamicObject) {
        if self.is_paused() {
            return;
        }
        let Some(id) = ObjectId::of(live) else { return };
        let declared = self.declared.read().await.clone();
        let Some(declared_obj) = declared.objects.get(&id) else {
            // Not ours to manage; the watch label filter already restricted
            // events to managed objects, so this is another sync's object.
            return;
        };

        let live_manager = metadata::manager_of(live);
        let ours = self.manager();
        if !live_manager.is_empty() && live_manager != ours {
            // A foreign manager claims an object we declare.
            let report = StatusError::management_conflict(&id.to_string(), live_manager, &ours);
            if self.conflict_tx.try_send(report).is_err() {
                debug!(object = %id, "Conflict channel full, dropping report");
            }
            return;
        }

        if metadata::ignores_mutation(live) {
            return;
        }

        if let Some(drift) = drifted_fields(declared_obj, live) {
            info!(object = %id, fields = %drift, "Reverting drift");
            self.reapply(declared_obj, &id).await;
        }
    }

    /// Handle deletion of a managed object: re-create from the declared
    /// version unless the sync is tearing down (watchers are paused then).
    pub async fn handle_delete(&self, gone: &DynamicObject) {
        if self.is_paused() {
            return;
        }
        let Some(id) = ObjectId::of(gone) else { return };
        let declared = self.declared.read().await.clone();
        let Some(declared_obj) = declared.objects.get(&id) else {
            return;
        };
        info!(object = %id, "Re-creating deleted managed object");
        self.reapply(declared_obj, &id).await;
    }

    async fn reapply(&self, declared: &DynamicObject, id: &ObjectId) {
        let Ok(resource) = api_resource_of(declared) else {
            return;
        };
        let api: Api<DynamicObject> = match declared.metadata.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        let Some(name) = declared.metadata.name.as_deref() else {
            return;
        };
        // Force: the corrective apply must take field ownership back from
        // whoever mutated the object.
        let params = PatchParams::apply(&self.field_manager).force();
        if let Err(e) = api.patch(name, &params, &Patch::Apply(declared)).await {
            warn!(object = %id, error = %e, "Corrective apply failed");
        }
    }
}

/// Watch one GroupKind until aborted.
async fn watch_group_kind(remediator: Arc<Remediator>, resource: ApiResource) {
    use kube::runtime::WatchStreamExt;

    let api = remediator.scoped_api(&resource);
    let config = watcher::Config::default()
        .labels(&format!(
            "{}={}",
            metadata::MANAGED_LABEL,
            metadata::MANAGED_ENABLED
        ))
        .any_semantic();

    let mut stream = std::pin::pin!(watcher::watcher(api, config).default_backoff());
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                remediator.handle_change(&obj).await;
            }
            Ok(watcher::Event::Delete(obj)) => {
                remediator.handle_delete(&obj).await;
            }
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
            Err(e) => {
                debug!(kind = %resource.kind, error = %e, "Watch error, backing off");
            }
        }
    }
}

/// Fields of the declared snapshot on which the live object diverges.
///
/// Returns None when there is no drift worth correcting.
pub fn drifted_fields(
    declared: &DynamicObject,
    live: &DynamicObject,
) -> Option<fieldpath::FieldSet> {
    let snapshot = metadata::declared_fields(declared)
        .or_else(|| Some(metadata::declared_field_snapshot(declared)))?;

    let declared_value = serde_json::to_value(declared).ok()?;
    let live_value = serde_json::to_value(live).ok()?;
    let diff = fieldpath::diff_paths(&declared_value, &live_value);
    let drift = diff.intersection(&snapshot);
    if drift.is_empty() { None } else { Some(drift) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Scope;
    use crate::metadata::StampContext;
    use kube::core::TypeMeta;

    fn declared_object() -> DynamicObject {
        let mut obj = DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
            }),
            metadata: Default::default(),
            data: serde_json::json!({"data": {"key": "declared"}}),
        };
        obj.metadata.name = Some("settings".into());
        obj.metadata.namespace = Some("app".into());
        let ctx = StampContext {
            scope: Scope::Root,
            sync_name: "root-sync".into(),
            sync_kind: "RootSync",
            source_url: "https://example.com/config".into(),
        };
        metadata::stamp(&mut obj, &ctx, "cm.yaml", "abc123");
        obj
    }

    #[test]
    fn no_drift_on_identical_object() {
        let declared = declared_object();
        assert!(drifted_fields(&declared, &declared).is_none());
    }

    #[test]
    fn declared_field_change_is_drift() {
        let declared = declared_object();
        let mut live = declared.clone();
        live.data["data"]["key"] = serde_json::json!("mutated");
        let drift = drifted_fields(&declared, &live).expect("drift detected");
        assert!(drift.contains("data.key"));
    }

    #[test]
    fn undeclared_field_change_is_not_drift() {
        let declared = declared_object();
        let mut live = declared.clone();
        // Server-populated fields are not in the declared snapshot.
        live.metadata.resource_version = Some("42".into());
        live.data["status"] = serde_json::json!({"observed": true});
        assert!(drifted_fields(&declared, &live).is_none());
    }

    #[test]
    fn management_label_removal_is_drift() {
        let declared = declared_object();
        let mut live = declared.clone();
        live.metadata
            .labels
            .as_mut()
            .unwrap()
            .remove(metadata::MANAGED_LABEL);
        assert!(drifted_fields(&declared, &live).is_some());
    }
}
