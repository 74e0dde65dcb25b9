//! Controller loop for RootSync objects.
//!
//! Watches RootSync plus the worker resources the manager owns in the
//! controller namespace, mapping events on those back to the owning sync.
//! The shared ClusterRoleBinding maps to every RootSync, since its subject
//! list is jointly derived from all of them.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info};

use crate::crd::{CONTROLLER_NAMESPACE, RootSync, Scope};
use crate::manager::context::ManagerContext;
use crate::manager::names::{self, ROOT_RECONCILER_CLUSTER_ROLE_BINDING};
use crate::manager::reconcile::{error_policy, reconcile_sync};
use crate::{create_filtered_stream, default_watcher_config};

/// Map an owned object in the controller namespace back to its RootSync.
fn map_worker_object(store: &Store<RootSync>, name: &str) -> Vec<ObjectRef<RootSync>> {
    if !names::is_reconciler_resource(name) {
        return Vec::new();
    }
    store
        .state()
        .iter()
        .filter(|rs| names::reconciler_name(&Scope::Root, &rs.name_any()) == name)
        .map(|rs| ObjectRef::from_obj(rs.as_ref()))
        .collect()
}

/// The shared ClusterRoleBinding maps to every RootSync.
fn map_cluster_role_binding(store: &Store<RootSync>, name: &str) -> Vec<ObjectRef<RootSync>> {
    if name != ROOT_RECONCILER_CLUSTER_ROLE_BINDING {
        return Vec::new();
    }
    store
        .state()
        .iter()
        .map(|rs| ObjectRef::from_obj(rs.as_ref()))
        .collect()
}

/// A secret in the controller namespace maps to the RootSync referencing it
/// (root secrets are referenced in place, copies carry the worker prefix).
fn map_secret(store: &Store<RootSync>, name: &str) -> Vec<ObjectRef<RootSync>> {
    store
        .state()
        .iter()
        .filter(|rs| {
            let spec = &rs.spec.sync;
            let reconciler = names::reconciler_name(&Scope::Root, &rs.name_any());
            spec.auth_secret_name() == name
                || spec.ca_cert_secret_name() == name
                || name.starts_with(&format!("{reconciler}-"))
        })
        .map(|rs| ObjectRef::from_obj(rs.as_ref()))
        .collect()
}

/// Run the RootSync controller until the stream ends.
pub async fn run(client: Client, ctx: Arc<ManagerContext>) {
    info!("Starting RootSync controller");

    let syncs: Api<RootSync> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), CONTROLLER_NAMESPACE);
    let service_accounts: Api<ServiceAccount> =
        Api::namespaced(client.clone(), CONTROLLER_NAMESPACE);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), CONTROLLER_NAMESPACE);
    let cluster_role_bindings: Api<ClusterRoleBinding> = Api::all(client.clone());

    let watcher_config = default_watcher_config();
    let (reader, stream) = create_filtered_stream(syncs, watcher_config.clone());

    let deploy_reader = reader.clone();
    let sa_reader = reader.clone();
    let secret_reader = reader.clone();
    let crb_reader = reader.clone();

    kube::runtime::Controller::for_stream(stream, reader)
        .watches(deployments, watcher_config.clone(), move |d: Deployment| {
            map_worker_object(&deploy_reader, &d.name_any())
        })
        .watches(
            service_accounts,
            watcher_config.clone(),
            move |sa: ServiceAccount| map_worker_object(&sa_reader, &sa.name_any()),
        )
        .watches(secrets, watcher_config.clone(), move |s: Secret| {
            map_secret(&secret_reader, &s.name_any())
        })
        .watches(
            cluster_role_bindings,
            WatcherConfig::default().any_semantic(),
            move |crb: ClusterRoleBinding| map_cluster_role_binding(&crb_reader, &crb.name_any()),
        )
        .run(reconcile_sync, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => debug!("Reconciled RootSync: {}", obj.name),
                Err(e) => {
                    let not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ObjectNotFound(_)
                    );
                    if not_found {
                        debug!("RootSync no longer exists: {e:?}");
                    } else {
                        error!("RootSync reconciliation error: {e:?}");
                    }
                }
            }
        })
        .await;

    error!("RootSync controller stream ended unexpectedly");
}
