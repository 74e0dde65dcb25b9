//! The per-sync inventory: the authoritative list of object identities this
//! reconciler owns in the cluster.
//!
//! Persisted as a single ConfigMap owned by the reconciler (identities, not
//! object references, to keep the graph acyclic). The applier diffs the
//! declared set against it and updates it atomically with per-object
//! actuation results after every pass. The inventory survives worker
//! restarts and spec generation bumps.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ObjectMeta, Patch, PatchParams};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};

use crate::crd::{CONTROLLER_NAMESPACE, Scope};
use crate::errors::StatusError;
use crate::metadata::ObjectId;

/// Data key inside the inventory ConfigMap.
const INVENTORY_KEY: &str = "inventory";

/// Field manager for inventory writes.
const INVENTORY_FIELD_MANAGER: &str = "reconciler-inventory";

/// Per-object actuation result recorded after an apply pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Actuation {
    /// Not yet attempted in the current pass.
    Pending,
    /// Applied (or pruned) successfully.
    Succeeded,
    /// The apply or prune failed; the error is in sync status.
    Failed,
    /// Prune skipped because the object carries the prevent-deletion marker.
    SkippedPrune,
}

/// One inventory record.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct InventoryEntry {
    #[serde(flatten)]
    pub id: ObjectId,
    /// apiVersion the object was declared with; pruning needs it to build
    /// the request path after the declaration is gone.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    pub status: Actuation,
}

/// The full inventory for one sync.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Inventory {
    /// Source commit the inventory was last written for.
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub entries: Vec<InventoryEntry>,
}

impl Inventory {
    /// All identities currently tracked.
    pub fn ids(&self) -> Vec<ObjectId> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    /// Entries in the inventory but absent from the declared set; these are
    /// the prune candidates.
    pub fn prune_candidates(&self, declared: &[ObjectId]) -> Vec<InventoryEntry> {
        self.entries
            .iter()
            .filter(|e| !declared.contains(&e.id))
            .cloned()
            .collect()
    }

    /// Whether the inventory covers every given identity.
    pub fn contains_all(&self, ids: &[ObjectId]) -> bool {
        ids.iter()
            .all(|id| self.entries.iter().any(|e| &e.id == id))
    }
}

/// Reads and writes the inventory ConfigMap.
pub struct InventoryClient {
    api: Api<ConfigMap>,
    name: String,
    labels: BTreeMap<String, String>,
}

impl InventoryClient {
    /// The inventory lives next to the objects it tracks: the controller
    /// namespace for root syncs, the tenant namespace for namespace syncs.
    pub fn new(client: Client, scope: &Scope, reconciler: &str) -> Self {
        let namespace = match scope {
            Scope::Root => CONTROLLER_NAMESPACE,
            Scope::Namespace(ns) => ns.as_str(),
        };
        InventoryClient {
            api: Api::namespaced(client, namespace),
            name: reconciler.to_string(),
            labels: BTreeMap::from([(
                crate::metadata::RECONCILER_LABEL.to_string(),
                reconciler.to_string(),
            )]),
        }
    }

    /// Load the persisted inventory; absent means empty (first sync).
    pub async fn load(&self) -> Result<Inventory, StatusError> {
        match self.api.get(&self.name).await {
            Ok(cm) => {
                let raw = cm
                    .data
                    .as_ref()
                    .and_then(|d| d.get(INVENTORY_KEY))
                    .cloned()
                    .unwrap_or_default();
                if raw.is_empty() {
                    return Ok(Inventory::default());
                }
                serde_json::from_str(&raw).map_err(|e| {
                    StatusError::internal(format!("corrupt inventory {}: {e}", self.name))
                })
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(Inventory::default()),
            Err(e) => Err(StatusError::api_server(format!(
                "failed to get inventory {}: {e}",
                self.name
            ))),
        }
    }

    /// Persist the inventory in one write.
    pub async fn save(&self, inventory: &Inventory) -> Result<(), StatusError> {
        let body = serde_json::to_string(inventory)
            .map_err(|e| StatusError::internal(format!("unable to encode inventory: {e}")))?;
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(self.labels.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(INVENTORY_KEY.to_string(), body)])),
            ..Default::default()
        };
        self.api
            .patch(
                &self.name,
                &PatchParams::apply(INVENTORY_FIELD_MANAGER).force(),
                &Patch::Apply(&cm),
            )
            .await
            .map_err(|e| {
                StatusError::api_server(format!("failed to update inventory {}: {e}", self.name))
            })?;
        Ok(())
    }
}
