//! The reconcile body shared by the RootSync and RepoSync controllers.
//!
//! Per pass: validate, ensure the finalizer, copy auth secrets, provision
//! the ServiceAccount and RBAC, shape the worker Deployment, then translate
//! the Deployment's kstatus onto the sync conditions. Deletion runs the
//! same resources down in reverse and removes the finalizer last.
//!
//! The whole body runs under a per-kind mutex: subject lists on the shared
//! RBAC objects are the only cross-sync mutable state and must not be
//! mutated concurrently.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};
use kube::runtime::controller::Action;
use tracing::{debug, error, info, warn};

use crate::crd::{CONTROLLER_NAMESPACE, FINALIZER, Scope, SyncApi};
use crate::manager::context::ManagerContext;
use crate::manager::deployment::{self, DeploymentInput};
use crate::manager::error::{Error, Result};
use crate::manager::{kstatus, names, rbac, secrets, status, validation};
use crate::notifications;

/// Requeue interval once a sync is healthy.
const STEADY_REQUEUE: Duration = Duration::from_secs(60);
/// Requeue interval while the worker deployment is rolling out.
const ROLLOUT_REQUEUE: Duration = Duration::from_secs(10);

/// Reconcile one sync object.
pub async fn reconcile_sync<S: SyncApi>(
    obj: Arc<S>,
    ctx: Arc<ManagerContext>,
) -> Result<Action> {
    let _guard = ctx.reconcile_lock.lock().await;
    let start = Instant::now();

    let scope = obj.scope_of();
    let name = obj.name_any();
    let kind = S::sync_kind();
    let reconciler = names::reconciler_name(&scope, &name);
    let api = S::scoped_api(ctx.client.clone(), &scope);
    let key = format!("{kind}/{name}");

    debug!(name = %name, kind, reconciler = %reconciler, "Reconciling sync object");

    if obj.meta().deletion_timestamp.is_some() {
        return teardown(&ctx, &api, &obj, &scope, &reconciler).await;
    }

    // Ensure the finalizer before provisioning anything, so a delete racing
    // this pass still gets a teardown.
    if !obj.finalizers().iter().any(|f| f == FINALIZER) {
        info!(name = %name, kind, "Adding finalizer");
        let mut finalizers = obj.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // The caching client can hand back a version we already processed before
    // our own status write became visible. Reassert idempotently rather than
    // skipping: every upsert below is a no-op when the state already matches.
    let resource_version = obj.resource_version().unwrap_or_default();
    if ctx.state.is_last_reconciled(&key, &resource_version) {
        debug!(name = %name, kind, resource_version = %resource_version, "Reasserting previously reconciled version");
    }

    let mut updated = (*obj).clone();

    // Validation failures stall the sync and wait for a spec change.
    if let Err(e) = validation::validate_namespace(&scope)
        .and_then(|()| validation::validate_reconciler_name(&reconciler))
        .and_then(|()| validation::validate_spec(obj.sync_spec(), &scope))
    {
        error!(name = %name, kind, error = %e, "Validation failed");
        updated.sync_status_mut().set_stalled("Validation", &e.to_string());
        status::update_status(&ctx, &api, &obj, &mut updated).await?;
        return Ok(Action::await_change());
    }

    let spec = obj.sync_spec();
    let auth = spec.auth();

    // Auth secret copy. Secret errors retry: the user may create or fix the
    // secret without touching the sync spec.
    let auth_secret = match secrets::upsert_auth_secret(
        &ctx.client,
        &scope,
        auth,
        spec.auth_secret_name(),
        &reconciler,
    )
    .await
    {
        Ok(secret) => secret,
        Err(e) => {
            warn!(name = %name, kind, error = %e, "Auth secret reconcile failed");
            updated.sync_status_mut().set_stalled("Secret", &e.to_string());
            status::update_status(&ctx, &api, &obj, &mut updated).await?;
            return Err(e);
        }
    };
    let ca_cert_secret = match secrets::upsert_ca_cert_secret(
        &ctx.client,
        &scope,
        spec.ca_cert_secret_name(),
        &reconciler,
    )
    .await
    {
        Ok(secret) => secret,
        Err(e) => {
            warn!(name = %name, kind, error = %e, "CA cert secret reconcile failed");
            updated.sync_status_mut().set_stalled("Secret", &e.to_string());
            status::update_status(&ctx, &api, &obj, &mut updated).await?;
            return Err(e);
        }
    };
    let auth_secret_keys = match &auth_secret {
        Some(secret) => secret_keys(&ctx, secret).await,
        None => BTreeSet::new(),
    };

    // Worker ServiceAccount, annotated for GCP SA auth.
    let labels = deployment::worker_labels(&DeploymentInput {
        scope: &scope,
        sync_name: &name,
        sync_kind: kind,
        sync_generation: obj.meta().generation.unwrap_or(0),
        reconciler: &reconciler,
        spec,
        cluster_name: &ctx.cluster_name,
        reconciler_polling_period_secs: ctx.reconciler_polling_period.as_secs(),
        hydration_polling_period_secs: ctx.hydration_polling_period.as_secs(),
        autopilot: ctx.autopilot,
        membership: ctx.state.membership(),
        auth_secret: auth_secret.clone(),
        ca_cert_secret: ca_cert_secret.clone(),
        auth_secret_keys: auth_secret_keys.clone(),
        notification_enabled: false,
        notification_config: spec.notification_config.as_ref(),
    });
    if let Err(e) = rbac::upsert_service_account(
        &ctx.client,
        &reconciler,
        spec.gcp_service_account_email(),
        &labels,
    )
    .await
    {
        error!(name = %name, kind, error = %e, "ServiceAccount reconcile failed");
        updated
            .sync_status_mut()
            .set_stalled("ServiceAccount", &e.to_string());
        status::update_status(&ctx, &api, &obj, &mut updated).await?;
        return Err(e);
    }

    // RBAC: per-namespace RoleBinding or shared root ClusterRoleBinding.
    let rbac_result = match &scope {
        Scope::Root => rbac::upsert_cluster_role_binding_subject(&ctx.client, &reconciler).await,
        Scope::Namespace(ns) => rbac::upsert_role_binding(&ctx.client, ns, &reconciler).await,
    };
    if let Err(e) = rbac_result {
        error!(name = %name, kind, error = %e, "RBAC reconcile failed");
        updated.sync_status_mut().set_stalled("RBAC", &e.to_string());
        status::update_status(&ctx, &api, &obj, &mut updated).await?;
        return Err(e);
    }

    // Notification enablement: subscription annotations or a referenced
    // ConfigMap carrying a subscriptions block.
    let notification_enabled = match notifications::notification_enabled(
        &ctx.client,
        match &scope {
            Scope::Root => CONTROLLER_NAMESPACE,
            Scope::Namespace(ns) => ns,
        },
        obj.meta().annotations.as_ref(),
        spec.notification_config.as_ref(),
    )
    .await
    {
        Ok(enabled) => enabled,
        Err(e) => {
            error!(name = %name, kind, error = %e, "Notification configuration check failed");
            updated
                .sync_status_mut()
                .set_stalled("Notification", &e.to_string());
            status::update_status(&ctx, &api, &obj, &mut updated).await?;
            return Err(e);
        }
    };

    // Worker Deployment: build desired, merge over existing preserving
    // unowned fields, write only on change.
    let input = DeploymentInput {
        scope: &scope,
        sync_name: &name,
        sync_kind: kind,
        sync_generation: obj.meta().generation.unwrap_or(0),
        reconciler: &reconciler,
        spec,
        cluster_name: &ctx.cluster_name,
        reconciler_polling_period_secs: ctx.reconciler_polling_period.as_secs(),
        hydration_polling_period_secs: ctx.hydration_polling_period.as_secs(),
        autopilot: ctx.autopilot,
        membership: ctx.state.membership(),
        auth_secret,
        ca_cert_secret,
        auth_secret_keys,
        notification_enabled,
        notification_config: spec.notification_config.as_ref(),
    };
    let latest = match upsert_deployment(&ctx, &input).await {
        Ok(deployment) => deployment,
        Err(e) => {
            error!(name = %name, kind, error = %e, "Deployment reconcile failed");
            updated
                .sync_status_mut()
                .set_stalled("Deployment", &e.to_string());
            status::update_status(&ctx, &api, &obj, &mut updated).await?;
            return Err(e);
        }
    };

    updated.sync_status_mut().reconciler = reconciler.clone();
    let workload = kstatus::compute(&latest);
    status::apply_workload_status(updated.sync_status_mut(), &workload);
    let wrote = status::update_status(&ctx, &api, &obj, &mut updated).await?;

    if let Some(health) = &ctx.health_state {
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        health
            .metrics
            .record_reconcile(kind, &namespace, &name, start.elapsed().as_secs_f64());
    }
    if wrote && workload == kstatus::WorkloadStatus::Current {
        info!(name = %name, kind, "Sync object reconcile successful");
    }
    let requeue = match workload {
        kstatus::WorkloadStatus::Current => STEADY_REQUEUE,
        _ => ROLLOUT_REQUEUE,
    };
    Ok(Action::requeue(requeue))
}

async fn secret_keys(ctx: &ManagerContext, secret_name: &str) -> BTreeSet<String> {
    let api: Api<k8s_openapi::api::core::v1::Secret> =
        Api::namespaced(ctx.client.clone(), CONTROLLER_NAMESPACE);
    match api.get(secret_name).await {
        Ok(secret) => secret
            .data
            .map(|d| d.into_keys().collect())
            .unwrap_or_default(),
        Err(_) => BTreeSet::new(),
    }
}

/// Create or update the worker Deployment; returns the live object used for
/// kstatus computation.
async fn upsert_deployment(
    ctx: &ManagerContext,
    input: &DeploymentInput<'_>,
) -> Result<Deployment> {
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), CONTROLLER_NAMESPACE);
    let existing = match api.get(input.reconciler).await {
        Ok(d) => Some(d),
        Err(kube::Error::Api(e)) if e.code == 404 => None,
        Err(e) => return Err(Error::Kube(e)),
    };

    let desired = deployment::build_deployment(input)?;
    let (merged, changed) = deployment::merge_with_existing(desired, existing.clone())?;

    match (existing, changed) {
        (None, _) => {
            let created = api.create(&PostParams::default(), &merged).await?;
            info!(deployment = %input.reconciler, "Created worker Deployment");
            Ok(created)
        }
        (Some(existing), false) => Ok(existing),
        (Some(_), true) => {
            let replaced = api
                .replace(input.reconciler, &PostParams::default(), &merged)
                .await?;
            info!(deployment = %input.reconciler, "Updated worker Deployment");
            Ok(replaced)
        }
    }
}

/// Delete worker resources in order and remove the finalizer last.
async fn teardown<S: SyncApi>(
    ctx: &ManagerContext,
    api: &Api<S>,
    obj: &Arc<S>,
    scope: &Scope,
    reconciler: &str,
) -> Result<Action> {
    let name = obj.name_any();
    let kind = S::sync_kind();
    info!(name = %name, kind, reconciler = %reconciler, "Tearing down worker resources");

    // 1. Deployment
    let deploy_api: Api<Deployment> = Api::namespaced(ctx.client.clone(), CONTROLLER_NAMESPACE);
    match deploy_api.delete(reconciler, &DeleteParams::default()).await {
        Ok(_) => info!(deployment = %reconciler, "Deleted worker Deployment"),
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(Error::Kube(e)),
    }

    // 2. ServiceAccount
    rbac::delete_service_account(&ctx.client, reconciler).await?;

    // 3. Managed secret copies
    secrets::delete_managed_secrets(&ctx.client, reconciler).await?;

    // 4. RBAC subject (deleting the shared binding when it empties)
    match scope {
        Scope::Root => {
            rbac::remove_cluster_role_binding_subject(&ctx.client, reconciler).await?;
        }
        Scope::Namespace(ns) => {
            rbac::remove_role_binding_subject(&ctx.client, ns, reconciler).await?;
        }
    }

    // 5. Finalizer, once owned resources are confirmed gone.
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    match api
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => info!(name = %name, kind, "Removed finalizer"),
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(Error::Kube(e)),
    }

    ctx.state.clear_last_reconciled(&format!("{kind}/{name}"));
    Ok(Action::await_change())
}

/// Error policy shared by both sync controllers.
pub fn error_policy<S: SyncApi>(obj: Arc<S>, error: &Error, ctx: Arc<ManagerContext>) -> Action {
    let name = obj.name_any();
    if let Some(health) = &ctx.health_state {
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        health.metrics.record_error(S::sync_kind(), &namespace, &name);
    }
    if error.is_not_found() {
        debug!(name = %name, "Sync object not found (likely deleted)");
        return Action::await_change();
    }
    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable reconcile error");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable reconcile error");
        Action::requeue(Duration::from_secs(3600))
    }
}
