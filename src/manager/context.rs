//! Shared context for the reconciler-manager controllers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{debug, info};

use crate::health::HealthState;

/// Fleet membership details used for federated workload identity.
#[derive(Clone, Debug, PartialEq)]
pub struct FleetMembership {
    /// Workload identity pool, e.g. `my-project.svc.id.goog`.
    pub workload_identity_pool: String,
    /// Identity provider URL for the cluster.
    pub identity_provider: String,
}

/// Name of the singleton fleet Membership object.
pub const FLEET_MEMBERSHIP_NAME: &str = "membership";

/// Mutable manager state shared by both controllers, separated from the
/// client so the bookkeeping is testable without a cluster.
#[derive(Default)]
pub struct ManagerState {
    /// Cached fleet membership; None when the cluster is unregistered.
    membership: Mutex<Option<FleetMembership>>,
    /// ResourceVersion last reconciled per sync, to spot stale cache reads.
    last_reconciled: Mutex<HashMap<String, String>>,
}

impl ManagerState {
    /// Current fleet membership, if the cluster is registered.
    pub fn membership(&self) -> Option<FleetMembership> {
        self.membership.lock().expect("membership lock").clone()
    }

    /// Replace the cached membership (None when unregistered).
    pub fn set_membership(&self, membership: Option<FleetMembership>) {
        let mut guard = self.membership.lock().expect("membership lock");
        if *guard != membership {
            info!(registered = membership.is_some(), "Fleet membership changed");
        }
        *guard = membership;
    }

    /// Whether this sync was already reconciled at this resourceVersion.
    ///
    /// Used to detect the caching client handing back an object version we
    /// already processed; the caller reasserts (idempotent) rather than
    /// skipping, since our own status write may not be visible yet.
    pub fn is_last_reconciled(&self, key: &str, resource_version: &str) -> bool {
        self.last_reconciled
            .lock()
            .expect("last_reconciled lock")
            .get(key)
            .is_some_and(|rv| rv == resource_version)
    }

    pub fn set_last_reconciled(&self, key: String, resource_version: String) {
        self.last_reconciled
            .lock()
            .expect("last_reconciled lock")
            .insert(key, resource_version);
    }

    pub fn clear_last_reconciled(&self, key: &str) {
        self.last_reconciled
            .lock()
            .expect("last_reconciled lock")
            .remove(key);
    }
}

/// Shared state injected into both sync controllers.
pub struct ManagerContext {
    /// Kubernetes client
    pub client: Client,
    /// Name of the cluster this manager runs in (CLUSTER_NAME).
    pub cluster_name: String,
    /// How often reconcilers poll the filesystem for source changes.
    pub reconciler_polling_period: Duration,
    /// How often hydration controllers poll for rendering work.
    pub hydration_polling_period: Duration,
    /// Whether the cluster was detected as GKE Autopilot at startup.
    pub autopilot: bool,
    /// Optional health state for metrics and readiness.
    pub health_state: Option<Arc<HealthState>>,
    /// Membership cache and reconcile bookkeeping.
    pub state: ManagerState,
    /// Serializes reconcile bodies within one kind; shared-subject CRB
    /// mutations require it.
    pub reconcile_lock: tokio::sync::Mutex<()>,
}

impl ManagerContext {
    pub fn new(
        client: Client,
        cluster_name: String,
        reconciler_polling_period: Duration,
        hydration_polling_period: Duration,
        autopilot: bool,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            cluster_name,
            reconciler_polling_period,
            hydration_polling_period,
            autopilot,
            health_state,
            state: ManagerState::default(),
            reconcile_lock: tokio::sync::Mutex::new(()),
        }
    }
}

/// Detect GKE Autopilot by the presence of its workload defaulting webhook.
/// Autopilot rewrites container resources, so the manager must use the
/// Autopilot-appropriate defaults to avoid a permanent reconcile fight.
pub async fn detect_autopilot(client: &Client) -> bool {
    let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    match api.list(&Default::default()).await {
        Ok(list) => list.items.iter().any(|w| {
            w.metadata
                .name
                .as_deref()
                .is_some_and(|n| n.starts_with("workload-defaulter.config.common-webhooks"))
        }),
        Err(e) => {
            debug!(error = %e, "Autopilot detection failed, assuming standard cluster");
            false
        }
    }
}
