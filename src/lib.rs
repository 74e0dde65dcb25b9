//! sync-operator library crate
//!
//! A Kubernetes-native GitOps platform: RootSync and RepoSync objects
//! declare a source of truth (git, OCI, or helm); the reconciler-manager
//! provisions a dedicated worker per sync; the worker continuously pulls,
//! renders, validates, applies, and remediates the declared configuration.

pub mod crd;
pub mod errors;
pub mod fieldpath;
pub mod health;
pub mod manager;
pub mod metadata;
pub mod notifications;
pub mod reconciler;
pub mod webhooks;

pub use health::HealthState;
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{WatchStreamExt, predicates, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use manager::context::{FLEET_MEMBERSHIP_NAME, FleetMembership, ManagerContext};

/// Create the default watcher configuration for all controllers.
///
/// This ensures consistent behavior across all controllers:
/// - `any_semantic()`: More reliable resource discovery in test environments
pub(crate) fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a filtered stream for a resource type with standard optimizations.
///
/// This creates a reflector-backed stream that:
/// - Maintains an in-memory cache via reflector
/// - Uses automatic retry with exponential backoff on errors
/// - Converts watch events to objects (Added/Modified only)
/// - Filters out status-only updates via generation predicate
///
/// Returns the reflector store (for cache lookups and watch mappers) and
/// the filtered stream.
pub(crate) fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Watch the fleet Membership singleton and keep the manager's cache fresh.
///
/// Membership drives federated workload identity credential injection; a
/// deleted Membership clears the cache so the next reconcile drops the
/// projected token volumes.
async fn watch_fleet_membership(client: Client, ctx: Arc<ManagerContext>) {
    let resource = ApiResource {
        group: "hub.gke.io".into(),
        version: "v1".into(),
        api_version: "hub.gke.io/v1".into(),
        kind: "Membership".into(),
        plural: "memberships".into(),
    };
    let api: Api<DynamicObject> = Api::all_with(client, &resource);

    let mut stream =
        std::pin::pin!(watcher(api, WatcherConfig::default().any_semantic()).default_backoff());
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                if obj.metadata.name.as_deref() != Some(FLEET_MEMBERSHIP_NAME) {
                    continue;
                }
                let spec = &obj.data["spec"];
                let membership = FleetMembership {
                    workload_identity_pool: spec["workload_identity_pool"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    identity_provider: spec["identity_provider"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                };
                ctx.state.set_membership(Some(membership));
            }
            Ok(watcher::Event::Delete(obj)) => {
                if obj.metadata.name.as_deref() == Some(FLEET_MEMBERSHIP_NAME) {
                    ctx.state.set_membership(None);
                }
            }
            Ok(_) => {}
            Err(e) => {
                // The Membership CRD may simply not be installed.
                debug!(error = %e, "Membership watch error, backing off");
            }
        }
    }
}

/// Run the reconciler-manager: both sync controllers plus the membership
/// watcher, until any of them exits.
pub async fn run_manager(client: Client, ctx: Arc<ManagerContext>) {
    info!("Starting reconciler-manager controllers");

    if let Some(health) = &ctx.health_state {
        health.set_ready(true).await;
    }

    let root = tokio::spawn(manager::root_controller::run(client.clone(), ctx.clone()));
    let repo = tokio::spawn(manager::repo_controller::run(client.clone(), ctx.clone()));
    let membership = tokio::spawn(watch_fleet_membership(client, ctx));

    tokio::select! {
        _ = root => {}
        _ = repo => {}
        _ = membership => {}
    }
}
