//! RepoSync Custom Resource Definition.
//!
//! RepoSync is namespaced and declares a source of truth for a single tenant
//! namespace. Its reconciler only receives permissions within that namespace
//! through a RoleBinding, and the parser rejects objects that would escape
//! the namespace.

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::source::SyncSpec;
use super::status::SyncStatus;
use super::{Scope, SyncApi};

/// RepoSync declares configuration synced into a single namespace.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "syncoperator.smoketurner.com",
    version = "v1beta1",
    kind = "RepoSync",
    plural = "reposyncs",
    status = "SyncStatus",
    namespaced,
    printcolumn = r#"{"name":"Source", "type":"string", "jsonPath":".spec.sourceType"}"#,
    printcolumn = r#"{"name":"Synced", "type":"string", "jsonPath":".status.lastSyncedCommit"}"#,
    printcolumn = r#"{"name":"Syncing", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Syncing\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RepoSyncSpec {
    #[serde(flatten)]
    pub sync: SyncSpec,
}

impl std::ops::Deref for RepoSyncSpec {
    type Target = SyncSpec;

    fn deref(&self) -> &SyncSpec {
        &self.sync
    }
}

impl SyncApi for RepoSync {
    fn sync_kind() -> &'static str {
        "RepoSync"
    }

    fn scoped_api(client: kube::Client, scope: &Scope) -> kube::Api<Self> {
        match scope {
            Scope::Namespace(ns) => kube::Api::namespaced(client, ns),
            Scope::Root => kube::Api::all(client),
        }
    }

    fn scope_of(&self) -> Scope {
        Scope::Namespace(self.namespace().unwrap_or_default())
    }

    fn sync_spec(&self) -> &SyncSpec {
        &self.spec.sync
    }

    fn sync_status(&self) -> Option<&SyncStatus> {
        self.status.as_ref()
    }

    fn sync_status_mut(&mut self) -> &mut SyncStatus {
        self.status.get_or_insert_with(SyncStatus::default)
    }
}
