//! RootSync Custom Resource Definition.
//!
//! RootSync is cluster-scoped and declares a source of truth for
//! cluster-wide configuration. Its reconciler runs with cluster-admin-like
//! permissions granted through the shared root ClusterRoleBinding.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::source::SyncSpec;
use super::status::SyncStatus;
use super::{Scope, SyncApi};

/// RootSync declares cluster-wide configuration synced from one source.
///
/// Example:
/// ```yaml
/// apiVersion: syncoperator.smoketurner.com/v1beta1
/// kind: RootSync
/// metadata:
///   name: root-sync
/// spec:
///   sourceFormat: unstructured
///   sourceType: git
///   git:
///     repo: git@github.com:acme/platform-config
///     branch: main
///     dir: clusters/prod
///     auth: ssh
///     secretRef:
///       name: root-ssh-key
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "syncoperator.smoketurner.com",
    version = "v1beta1",
    kind = "RootSync",
    plural = "rootsyncs",
    status = "SyncStatus",
    printcolumn = r#"{"name":"Source", "type":"string", "jsonPath":".spec.sourceType"}"#,
    printcolumn = r#"{"name":"Synced", "type":"string", "jsonPath":".status.lastSyncedCommit"}"#,
    printcolumn = r#"{"name":"Syncing", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Syncing\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RootSyncSpec {
    #[serde(flatten)]
    pub sync: SyncSpec,
}

impl std::ops::Deref for RootSyncSpec {
    type Target = SyncSpec;

    fn deref(&self) -> &SyncSpec {
        &self.sync
    }
}

impl SyncApi for RootSync {
    fn sync_kind() -> &'static str {
        "RootSync"
    }

    fn scoped_api(client: kube::Client, _scope: &Scope) -> kube::Api<Self> {
        kube::Api::all(client)
    }

    fn scope_of(&self) -> Scope {
        Scope::Root
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
