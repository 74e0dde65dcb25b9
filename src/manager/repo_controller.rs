//! Controller loop for RepoSync objects.
//!
//! Secrets are watched across all namespaces: a RepoSync references secrets
//! in its own namespace, and the manager maintains copies in the controller
//! namespace. Both ends map back to the owning RepoSync. The per-namespace
//! RoleBinding is shared by all RepoSyncs in that namespace, so an event on
//! it requeues them all.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info};

use crate::crd::{CONTROLLER_NAMESPACE, RepoSync, Scope};
use crate::manager::context::ManagerContext;
use crate::manager::names::{self, NS_RECONCILER_ROLE_BINDING};
use crate::manager::reconcile::{error_policy, reconcile_sync};
use crate::{create_filtered_stream, default_watcher_config};

fn repo_sync_reconciler(rs: &RepoSync) -> String {
    let ns = rs.namespace().unwrap_or_default();
    names::reconciler_name(&Scope::Namespace(ns), &rs.name_any())
}

/// Map an owned object in the controller namespace back to its RepoSync.
fn map_worker_object(store: &Store<RepoSync>, name: &str) -> Vec<ObjectRef<RepoSync>> {
    if !name.starts_with(names::NS_RECONCILER_PREFIX) {
        return Vec::new();
    }
    store
        .state()
        .iter()
        .filter(|rs| repo_sync_reconciler(rs) == name)
        .map(|rs| ObjectRef::from_obj(rs.as_ref()))
        .collect()
}

/// Map a Secret event to affected RepoSyncs.
///
/// Copies in the controller namespace map one-to-one by worker prefix; user
/// secrets map to every RepoSync in the same namespace referencing them.
fn map_secret(store: &Store<RepoSync>, secret: &Secret) -> Vec<ObjectRef<RepoSync>> {
    let name = secret.name_any();
    let namespace = secret.namespace().unwrap_or_default();

    if namespace == CONTROLLER_NAMESPACE {
        if !name.starts_with(names::NS_RECONCILER_PREFIX) {
            return Vec::new();
        }
        return store
            .state()
            .iter()
            .filter(|rs| name.starts_with(&format!("{}-", repo_sync_reconciler(rs))))
            .map(|rs| ObjectRef::from_obj(rs.as_ref()))
            .collect();
    }

    store
        .state()
        .iter()
        .filter(|rs| {
            rs.namespace().as_deref() == Some(namespace.as_str()) && {
                let spec = &rs.spec.sync;
                spec.auth_secret_name() == name || spec.ca_cert_secret_name() == name
            }
        })
        .map(|rs| ObjectRef::from_obj(rs.as_ref()))
        .collect()
}

/// The namespace RoleBinding is shared; requeue every RepoSync next to it.
fn map_role_binding(store: &Store<RepoSync>, rb: &RoleBinding) -> Vec<ObjectRef<RepoSync>> {
    if rb.name_any() != NS_RECONCILER_ROLE_BINDING {
        return Vec::new();
    }
    let namespace = rb.namespace().unwrap_or_default();
    store
        .state()
        .iter()
        .filter(|rs| rs.namespace().as_deref() == Some(namespace.as_str()))
        .map(|rs| ObjectRef::from_obj(rs.as_ref()))
        .collect()
}

/// Run the RepoSync controller until the stream ends.
pub async fn run(client: Client, ctx: Arc<ManagerContext>) {
    info!("Starting RepoSync controller");

    let syncs: Api<RepoSync> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), CONTROLLER_NAMESPACE);
    let service_accounts: Api<ServiceAccount> =
        Api::namespaced(client.clone(), CONTROLLER_NAMESPACE);
    let secrets: Api<Secret> = Api::all(client.clone());
    let role_bindings: Api<RoleBinding> = Api::all(client.clone());

    let watcher_config = default_watcher_config();
    let (reader, stream) = create_filtered_stream(syncs, watcher_config.clone());

    let deploy_reader = reader.clone();
    let sa_reader = reader.clone();
    let secret_reader = reader.clone();
    let rb_reader = reader.clone();

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
            map_secret(&secret_reader, &s)
        })
        .watches(
            role_bindings,
            WatcherConfig::default().any_semantic(),
            move |rb: RoleBinding| map_role_binding(&rb_reader, &rb),
        )
        .run(reconcile_sync, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => debug!("Reconciled RepoSync: {}", obj.name),
                Err(e) => {
                    let not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ObjectNotFound(_)
                    );
                    if not_found {
                        debug!("RepoSync no longer exists: {e:?}");
                    } else {
                        error!("RepoSync reconciliation error: {e:?}");
                    }
                }
            }
        })
        .await;

    error!("RepoSync controller stream ended unexpectedly");
}
