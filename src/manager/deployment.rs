//! Reconciler worker Deployment construction and reconciliation.
//!
//! The manager owns a strict subset of the Deployment: replicas, the
//! container list (images, env, mounts), auth-derived volumes, the service
//! account, and the selector labels. Everything else a user edits on the
//! live object (tolerations, priorityClassName, extra pod metadata, ...) is
//! preserved by building the desired state on top of the existing object.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, KeyToPath, PodSpec, PodTemplateSpec,
    ProjectedVolumeSource, ResourceRequirements, SecretKeySelector, SecretVolumeSource,
    SecurityContext, ServiceAccountTokenProjection, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::crd::{AuthType, CONTROLLER_NAMESPACE, NotificationConfig, Scope, SourceType, SyncSpec};
use crate::manager::context::FleetMembership;
use crate::manager::error::{Error, Result};
use crate::metadata::RECONCILER_LABEL;
use crate::reconciler::REPO_ROOT;

/// Container names within the worker pod.
pub const RECONCILER_CONTAINER: &str = "reconciler";
pub const HYDRATION_CONTAINER: &str = "hydration-controller";
pub const GIT_SYNC_CONTAINER: &str = "git-sync";
pub const OCI_SYNC_CONTAINER: &str = "oci-sync";
pub const HELM_SYNC_CONTAINER: &str = "helm-sync";
pub const NOTIFICATION_CONTAINER: &str = "notification";
pub const ASKPASS_SIDECAR: &str = "gcenode-askpass-sidecar";

/// Volume names.
const REPO_VOLUME: &str = "repo";
const GIT_CREDS_VOLUME: &str = "git-creds";
const CA_CERT_VOLUME: &str = "ca-cert";
const GCP_KSA_VOLUME: &str = "gcp-ksa";

/// Default images; overridden through the manager's own deployment env.
const RECONCILER_IMAGE_ENV: &str = "RECONCILER_IMAGE";
const DEFAULT_RECONCILER_IMAGE: &str = "ghcr.io/smoketurner/sync-operator:latest";

/// Everything the deployment builder needs to know about one sync.
pub struct DeploymentInput<'a> {
    pub scope: &'a Scope,
    pub sync_name: &'a str,
    pub sync_kind: &'static str,
    pub sync_generation: i64,
    pub reconciler: &'a str,
    pub spec: &'a SyncSpec,
    pub cluster_name: &'a str,
    pub reconciler_polling_period_secs: u64,
    pub hydration_polling_period_secs: u64,
    pub autopilot: bool,
    pub membership: Option<FleetMembership>,
    /// Auth secret the pod mounts (already copied for namespace scope).
    pub auth_secret: Option<String>,
    /// CA cert secret the pod mounts.
    pub ca_cert_secret: Option<String>,
    /// Keys present in the auth secret (proxy wiring).
    pub auth_secret_keys: BTreeSet<String>,
    pub notification_enabled: bool,
    pub notification_config: Option<&'a NotificationConfig>,
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn reconciler_image() -> String {
    std::env::var(RECONCILER_IMAGE_ENV).unwrap_or_else(|_| DEFAULT_RECONCILER_IMAGE.to_string())
}

/// Whether federated workload identity credentials should be injected.
fn use_fwi_auth(auth: AuthType, membership: &Option<FleetMembership>) -> bool {
    auth == AuthType::GcpServiceAccount && membership.is_some()
}

/// Environment for the reconciler container.
fn reconciler_envs(input: &DeploymentInput<'_>) -> Vec<EnvVar> {
    let spec = input.spec;
    let overrides = spec.overrides();
    let mut envs = vec![
        env("CLUSTER_NAME", input.cluster_name),
        env("SCOPE", input.scope.to_string()),
        env("SYNC_NAME", input.sync_name),
        env("SYNC_GENERATION", input.sync_generation.to_string()),
        env("RECONCILER_NAME", input.reconciler),
        env("SYNC_DIR", spec.sync_dir()),
        env("SOURCE_TYPE", spec.source_type.to_string()),
        env("SOURCE_REPO", spec.source_repo()),
        env("SOURCE_REV", spec.source_rev()),
        env(
            "RECONCILE_TIMEOUT",
            format!("{}s", overrides.reconcile_timeout_secs()),
        ),
        env(
            "API_SERVER_TIMEOUT",
            format!("{}s", overrides.api_server_timeout_secs()),
        ),
        env(
            "RECONCILER_POLLING_PERIOD",
            format!("{}s", input.reconciler_polling_period_secs),
        ),
        env("STATUS_MODE", overrides.status_mode().to_string()),
        env(
            "NAMESPACE_STRATEGY",
            overrides.namespace_strategy().to_string(),
        ),
        env("RENDERING_ENABLED", "true"),
        env("SOURCE_FORMAT", spec.source_format.to_string()),
    ];
    if let Some(branch) = spec.source_branch() {
        envs.push(env("SOURCE_BRANCH", branch));
    }
    if let Scope::Namespace(ns) = input.scope {
        envs.push(env("NAMESPACE_NAME", ns.clone()));
    }
    envs
}

/// Environment for the hydration-controller container.
fn hydration_envs(input: &DeploymentInput<'_>) -> Vec<EnvVar> {
    let mut envs = vec![
        env("SCOPE", input.scope.to_string()),
        env("SYNC_NAME", input.sync_name),
        env("RECONCILER_NAME", input.reconciler),
        env("SYNC_DIR", input.spec.sync_dir()),
        env("SOURCE_TYPE", input.spec.source_type.to_string()),
        env(
            "HYDRATION_POLLING_PERIOD",
            format!("{}s", input.hydration_polling_period_secs),
        ),
    ];
    // Exec-style renderer plugins need a shell in the sandbox; off unless
    // the user opted in.
    if input.spec.overrides().enable_shell_in_rendering == Some(true) {
        envs.push(env("RENDERING_ENABLE_SHELL", "true"));
    }
    envs
}

/// Environment for the git-sync container.
fn git_sync_envs(input: &DeploymentInput<'_>) -> Vec<EnvVar> {
    let git = input.spec.git.as_ref();
    let overrides = input.spec.overrides();
    let mut envs = vec![
        env("GIT_SYNC_REPO", input.spec.source_repo()),
        env("GIT_SYNC_REV", input.spec.source_rev()),
        env(
            "GIT_SYNC_DEPTH",
            overrides.git_sync_depth.unwrap_or(1).to_string(),
        ),
        env(
            "GIT_SYNC_PERIOD",
            format!("{}s", git.and_then(|g| g.period).unwrap_or(15)),
        ),
    ];
    if let Some(branch) = input.spec.source_branch() {
        envs.push(env("GIT_SYNC_BRANCH", branch));
    }
    if let Some(git) = git {
        if git.no_ssl_verify {
            envs.push(env("GIT_SYNC_NO_SSL_VERIFY", "true"));
        }
        if git.auth == AuthType::Ssh {
            envs.push(env("GIT_KNOWN_HOSTS", "false"));
        }
        if let Some(proxy) = &git.proxy {
            envs.push(env("HTTPS_PROXY", proxy.clone()));
        } else if input.auth_secret_keys.contains("https_proxy")
            && let Some(secret) = &input.auth_secret
        {
            envs.push(secret_env("HTTPS_PROXY", secret, "https_proxy"));
        }
        if git.auth == AuthType::Token
            && let Some(secret) = &input.auth_secret
        {
            envs.push(secret_env("GIT_SYNC_USERNAME", secret, "username"));
            envs.push(secret_env("GIT_SYNC_PASSWORD", secret, "token"));
        }
    }
    envs.push(env("GIT_SYNC_AUTH", input.spec.auth().to_string()));
    envs
}

/// Environment for the oci-sync container.
fn oci_sync_envs(input: &DeploymentInput<'_>) -> Vec<EnvVar> {
    let oci = input.spec.oci.as_ref();
    vec![
        env("OCI_SYNC_IMAGE", input.spec.source_repo()),
        env("OCI_SYNC_AUTH", input.spec.auth().to_string()),
        env(
            "OCI_SYNC_WAIT",
            oci.and_then(|o| o.period).unwrap_or(15).to_string(),
        ),
    ]
}

/// Environment for the helm-sync container.
fn helm_sync_envs(input: &DeploymentInput<'_>) -> Vec<EnvVar> {
    let Some(helm) = input.spec.helm.as_ref() else {
        return Vec::new();
    };
    let release_namespace = helm.namespace.clone().unwrap_or_else(|| match input.scope {
        Scope::Root => "default".to_string(),
        Scope::Namespace(ns) => ns.clone(),
    });
    let mut envs = vec![
        env("HELM_REPO", helm.repo.clone()),
        env("HELM_CHART", helm.chart.clone()),
        env(
            "HELM_CHART_VERSION",
            helm.version.clone().unwrap_or_else(|| "latest".into()),
        ),
        env(
            "HELM_RELEASE_NAME",
            helm.release_name.clone().unwrap_or_else(|| helm.chart.clone()),
        ),
        env("HELM_RELEASE_NAMESPACE", release_namespace),
        env("HELM_INCLUDE_CRDS", helm.include_crds.to_string()),
        env("HELM_AUTH_TYPE", helm.auth.to_string()),
        env("HELM_SYNC_WAIT", helm.period.unwrap_or(3600).to_string()),
    ];
    if !helm.values.is_empty() {
        envs.push(env(
            "HELM_VALUES",
            serde_json::to_string(&helm.values).unwrap_or_default(),
        ));
    }
    if !helm.values_files.is_empty() {
        envs.push(env("HELM_VALUES_FILES", helm.values_files.join(",")));
    }
    if helm.auth == AuthType::Token
        && let Some(secret) = &input.auth_secret
    {
        envs.push(secret_env("HELM_USERNAME", secret, "username"));
        envs.push(secret_env("HELM_PASSWORD", secret, "token"));
    }
    envs
}

/// Environment for the notification container.
fn notification_envs(input: &DeploymentInput<'_>) -> Vec<EnvVar> {
    let (group, kind) = (crate::crd::API_GROUP, input.sync_kind);
    let namespace = match input.scope {
        Scope::Root => CONTROLLER_NAMESPACE.to_string(),
        Scope::Namespace(ns) => ns.clone(),
    };
    let mut envs = vec![
        env("NOTIFICATION_API_GROUP", group),
        env("NOTIFICATION_API_VERSION", "v1beta1"),
        env("NOTIFICATION_API_KIND", kind),
        env("NOTIFICATION_RESOURCE_NAME", input.sync_name),
        env("NOTIFICATION_RESOURCE_NAMESPACE", namespace),
    ];
    if let Some(config) = input.notification_config {
        if let Some(cm) = config.config_map_ref.as_ref().and_then(|r| r.name.clone()) {
            envs.push(env("NOTIFICATION_CONFIGMAP_NAME", cm));
        }
        if let Some(secret) = config.secret_ref.as_ref().and_then(|r| r.name.clone()) {
            envs.push(env("NOTIFICATION_SECRET_NAME", secret));
        }
    }
    envs
}

/// Default container resources; Autopilot rewrites requests to equal limits,
/// so defaults there are chosen to survive the rewrite unchanged.
fn default_resources(container: &str, autopilot: bool) -> ResourceRequirements {
    let (cpu_request, memory_request, memory_limit) = match container {
        RECONCILER_CONTAINER => ("50m", "200Mi", "5Gi"),
        HYDRATION_CONTAINER => ("10m", "100Mi", "1Gi"),
        GIT_SYNC_CONTAINER | OCI_SYNC_CONTAINER | HELM_SYNC_CONTAINER => ("10m", "200Mi", "1Gi"),
        _ => ("10m", "64Mi", "256Mi"),
    };
    let mut requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu_request.to_string())),
        ("memory".to_string(), Quantity(memory_request.to_string())),
    ]);
    let limits = if autopilot {
        // Requests become limits under Autopilot; mirror them to avoid a
        // permanent diff against the admission rewrite.
        requests.insert("memory".to_string(), Quantity(memory_limit.to_string()));
        requests.clone()
    } else {
        BTreeMap::from([("memory".to_string(), Quantity(memory_limit.to_string()))])
    };
    ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

/// Apply user resource and log-level overrides to a container.
fn apply_overrides(container: &mut Container, spec: &SyncSpec) {
    let overrides = spec.overrides();
    for o in &overrides.resources {
        if o.container_name != container.name {
            continue;
        }
        let resources = container.resources.get_or_insert_with(Default::default);
        let requests = resources.requests.get_or_insert_with(BTreeMap::new);
        if let Some(cpu) = &o.cpu_request {
            requests.insert("cpu".into(), Quantity(cpu.clone()));
        }
        if let Some(mem) = &o.memory_request {
            requests.insert("memory".into(), Quantity(mem.clone()));
        }
        let limits = resources.limits.get_or_insert_with(BTreeMap::new);
        if let Some(cpu) = &o.cpu_limit {
            limits.insert("cpu".into(), Quantity(cpu.clone()));
        }
        if let Some(mem) = &o.memory_limit {
            limits.insert("memory".into(), Quantity(mem.clone()));
        }
    }
    for l in &overrides.log_levels {
        if l.container_name == container.name {
            container
                .env
                .get_or_insert_with(Vec::new)
                .push(env("LOG_LEVEL", l.log_level.to_string()));
        }
    }
}

fn repo_mount() -> VolumeMount {
    VolumeMount {
        name: REPO_VOLUME.to_string(),
        mount_path: REPO_ROOT.to_string(),
        ..Default::default()
    }
}

fn container_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(true),
        ..Default::default()
    }
}

fn base_container(name: &str, command: &str, input: &DeploymentInput<'_>) -> Container {
    // Fields the API server would default are declared explicitly so the
    // built container compares equal against the live object and an
    // unchanged spec produces no write.
    let mut container = Container {
        name: name.to_string(),
        image: Some(reconciler_image()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![command.to_string()]),
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        volume_mounts: Some(vec![repo_mount()]),
        resources: Some(default_resources(name, input.autopilot)),
        security_context: Some(container_security_context()),
        ..Default::default()
    };
    apply_overrides(&mut container, input.spec);
    container
}

fn source_container(input: &DeploymentInput<'_>) -> Container {
    let (name, envs) = match input.spec.source_type {
        SourceType::Git => (GIT_SYNC_CONTAINER, git_sync_envs(input)),
        SourceType::Oci => (OCI_SYNC_CONTAINER, oci_sync_envs(input)),
        SourceType::Helm => (HELM_SYNC_CONTAINER, helm_sync_envs(input)),
    };
    let mut container = base_container(name, "/source-sync", input);
    container.env = Some(envs);

    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    let auth = input.spec.auth();
    if auth.requires_secret() && input.spec.source_type == SourceType::Git {
        mounts.push(VolumeMount {
            name: GIT_CREDS_VOLUME.to_string(),
            mount_path: "/etc/git-secret".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    if input.ca_cert_secret.is_some() {
        mounts.push(VolumeMount {
            name: CA_CERT_VOLUME.to_string(),
            mount_path: "/etc/ca-cert".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    if use_fwi_auth(auth, &input.membership) {
        mounts.push(VolumeMount {
            name: GCP_KSA_VOLUME.to_string(),
            mount_path: "/var/run/secrets/tokens/gcp-ksa".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        container.env.get_or_insert_with(Vec::new).push(env(
            "GOOGLE_APPLICATION_CREDENTIALS",
            "/var/run/secrets/tokens/gcp-ksa/google-application-credentials.json",
        ));
    }
    container
}

fn askpass_sidecar(input: &DeploymentInput<'_>) -> Container {
    let mut container = base_container(ASKPASS_SIDECAR, "/gcenode-askpass-sidecar", input);
    if let Some(email) = input.spec.gcp_service_account_email() {
        container.env = Some(vec![env("GSA_EMAIL", email)]);
    }
    container
}

/// Compute the pod volumes the manager owns, derived from the auth mode.
fn build_volumes(input: &DeploymentInput<'_>) -> Vec<Volume> {
    let mut volumes = vec![Volume {
        name: REPO_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    let auth = input.spec.auth();
    if auth.requires_secret()
        && input.spec.source_type == SourceType::Git
        && let Some(secret) = &input.auth_secret
    {
        volumes.push(Volume {
            name: GIT_CREDS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                default_mode: Some(0o440),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    if let Some(ca_secret) = &input.ca_cert_secret {
        volumes.push(Volume {
            name: CA_CERT_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(ca_secret.clone()),
                default_mode: Some(0o644),
                items: Some(vec![KeyToPath {
                    key: crate::manager::secrets::CA_CERT_KEY.to_string(),
                    path: "cert".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    if let Some(membership) = &input.membership
        && use_fwi_auth(auth, &input.membership)
    {
        volumes.push(Volume {
            name: GCP_KSA_VOLUME.to_string(),
            projected: Some(ProjectedVolumeSource {
                default_mode: Some(0o644),
                sources: Some(vec![VolumeProjection {
                    service_account_token: Some(ServiceAccountTokenProjection {
                        audience: Some(membership.workload_identity_pool.clone()),
                        expiration_seconds: Some(172800),
                        path: "token".to_string(),
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    volumes
}

/// Selector/pod labels owned by the manager.
pub fn worker_labels(input: &DeploymentInput<'_>) -> BTreeMap<String, String> {
    BTreeMap::from([
        (RECONCILER_LABEL.to_string(), input.reconciler.to_string()),
        (
            crate::metadata::SYNC_NAME_LABEL.to_string(),
            input.sync_name.to_string(),
        ),
        (
            crate::metadata::SYNC_KIND_LABEL.to_string(),
            input.sync_kind.to_string(),
        ),
        (
            crate::metadata::SYNC_NAMESPACE_LABEL.to_string(),
            match input.scope {
                Scope::Root => CONTROLLER_NAMESPACE.to_string(),
                Scope::Namespace(ns) => ns.clone(),
            },
        ),
    ])
}

/// Build the desired worker Deployment from scratch.
pub fn build_deployment(input: &DeploymentInput<'_>) -> Result<Deployment> {
    let labels = worker_labels(input);

    let mut reconciler = base_container(RECONCILER_CONTAINER, "/reconciler", input);
    reconciler.env = Some(reconciler_envs(input));

    let mut hydration = base_container(HYDRATION_CONTAINER, "/hydration-controller", input);
    hydration.env = Some(hydration_envs(input));

    let mut containers = vec![reconciler, hydration, source_container(input)];

    if input.spec.source_type == SourceType::Git
        && matches!(
            input.spec.auth(),
            AuthType::GceNode | AuthType::GcpServiceAccount
        )
    {
        containers.push(askpass_sidecar(input));
    }

    if input.notification_enabled {
        let mut notification = base_container(NOTIFICATION_CONTAINER, "/notification", input);
        notification.env = Some(notification_envs(input));
        containers.push(notification);
    }

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(input.reconciler.to_string()),
            namespace: Some(CONTROLLER_NAMESPACE.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    RECONCILER_LABEL.to_string(),
                    input.reconciler.to_string(),
                )])),
                ..Default::default()
            },
            strategy: None,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(input.reconciler.to_string()),
                    containers,
                    volumes: Some(build_volumes(input)),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Merge the desired state over the existing Deployment, reverting owned
/// fields while preserving user edits to everything else.
///
/// Returns the object to write and whether a write is needed.
pub fn merge_with_existing(
    desired: Deployment,
    existing: Option<Deployment>,
) -> Result<(Deployment, bool)> {
    let Some(existing) = existing else {
        return Ok((desired, true));
    };

    let mut merged = existing.clone();
    let desired_spec = desired
        .spec
        .ok_or_else(|| Error::Validation("desired deployment has no spec".into()))?;

    // Owned metadata: labels the selector and watches depend on. User labels
    // outside the owned set are preserved.
    if let Some(desired_labels) = desired.metadata.labels {
        let labels = merged.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (k, v) in desired_labels {
            labels.insert(k, v);
        }
    }

    let merged_spec = merged.spec.get_or_insert_with(Default::default);
    merged_spec.replicas = desired_spec.replicas;
    merged_spec.selector = desired_spec.selector.clone();

    let desired_template = desired_spec.template;
    if let Some(desired_meta) = desired_template.metadata {
        let template_meta = merged_spec
            .template
            .metadata
            .get_or_insert_with(Default::default);
        if let Some(labels) = desired_meta.labels {
            let merged_labels = template_meta.labels.get_or_insert_with(BTreeMap::new);
            for (k, v) in labels {
                merged_labels.insert(k, v);
            }
        }
    }

    let desired_pod = desired_template
        .spec
        .ok_or_else(|| Error::Validation("desired deployment has no pod spec".into()))?;
    let merged_pod = merged_spec
        .template
        .spec
        .get_or_insert_with(Default::default);
    // Owned pod fields: the container set, auth volumes, and identity.
    // tolerations, priorityClassName, nodeSelector, affinity and the rest
    // of the pod spec stay as the user set them.
    merged_pod.service_account_name = desired_pod.service_account_name;
    merged_pod.containers = desired_pod.containers;
    merged_pod.volumes = desired_pod.volumes;

    let changed = serde_json::to_value(&merged)? != serde_json::to_value(&existing)?;
    Ok((merged, changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GitSpec, SecretRef};

    fn git_input(spec: &SyncSpec) -> DeploymentInput<'_> {
        DeploymentInput {
            scope: &Scope::Root,
            sync_name: "root-sync",
            sync_kind: "RootSync",
            sync_generation: 1,
            reconciler: "root-reconciler",
            spec,
            cluster_name: "test-cluster",
            reconciler_polling_period_secs: 15,
            hydration_polling_period_secs: 5,
            autopilot: false,
            membership: None,
            auth_secret: None,
            ca_cert_secret: None,
            auth_secret_keys: BTreeSet::new(),
            notification_enabled: false,
            notification_config: None,
        }
    }

    fn git_spec(auth: AuthType) -> SyncSpec {
        SyncSpec {
            source_type: SourceType::Git,
            git: Some(GitSpec {
                repo: "git@github.com:acme/config".into(),
                branch: Some("main".into()),
                auth,
                secret_ref: auth.requires_secret().then(|| SecretRef {
                    name: Some("root-ssh-key".into()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn container_names(d: &Deployment) -> Vec<String> {
        d.spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    fn volume_names(d: &Deployment) -> Vec<String> {
        d.spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.clone())
            .collect()
    }

    #[test]
    fn ssh_auth_mounts_git_creds() {
        let spec = git_spec(AuthType::Ssh);
        let mut input = git_input(&spec);
        input.auth_secret = Some("root-ssh-key".into());
        let d = build_deployment(&input).unwrap();
        assert!(volume_names(&d).contains(&GIT_CREDS_VOLUME.to_string()));
        assert!(!container_names(&d).contains(&ASKPASS_SIDECAR.to_string()));
    }

    #[test]
    fn gcpserviceaccount_adds_askpass_and_drops_creds_volume() {
        let mut spec = git_spec(AuthType::GcpServiceAccount);
        spec.git.as_mut().unwrap().gcp_service_account_email =
            Some("sync@proj.iam.gserviceaccount.com".into());
        let input = git_input(&spec);
        let d = build_deployment(&input).unwrap();
        assert!(container_names(&d).contains(&ASKPASS_SIDECAR.to_string()));
        assert!(!volume_names(&d).contains(&GIT_CREDS_VOLUME.to_string()));
    }

    #[test]
    fn none_auth_has_no_creds_volume_or_sidecar() {
        let spec = git_spec(AuthType::None);
        let d = build_deployment(&git_input(&spec)).unwrap();
        assert!(!volume_names(&d).contains(&GIT_CREDS_VOLUME.to_string()));
        assert!(!container_names(&d).contains(&ASKPASS_SIDECAR.to_string()));
    }

    #[test]
    fn reconciler_env_carries_sync_identity() {
        let spec = git_spec(AuthType::None);
        let d = build_deployment(&git_input(&spec)).unwrap();
        let pod = d.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let reconciler = pod
            .containers
            .iter()
            .find(|c| c.name == RECONCILER_CONTAINER)
            .unwrap();
        let envs = reconciler.env.as_ref().unwrap();
        let get = |name: &str| {
            envs.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
        };
        assert_eq!(get("SCOPE").as_deref(), Some(":root"));
        assert_eq!(get("SYNC_NAME").as_deref(), Some("root-sync"));
        assert_eq!(get("SOURCE_TYPE").as_deref(), Some("git"));
        assert_eq!(get("SOURCE_BRANCH").as_deref(), Some("main"));
        assert_eq!(get("RECONCILE_TIMEOUT").as_deref(), Some("300s"));
    }

    #[test]
    fn merge_preserves_unowned_fields_and_reverts_owned() {
        let spec = git_spec(AuthType::None);
        let input = git_input(&spec);
        let desired = build_deployment(&input).unwrap();

        // Simulate a live object with user edits.
        let mut existing = desired.clone();
        {
            let pod = existing
                .spec
                .as_mut()
                .unwrap()
                .template
                .spec
                .as_mut()
                .unwrap();
            pod.priority_class_name = Some("system-node-critical".into());
            pod.tolerations = Some(vec![Default::default()]);
            pod.containers[0].image_pull_policy = Some("Always".into());
        }

        let (merged, changed) = merge_with_existing(desired, Some(existing)).unwrap();
        assert!(changed);
        let pod = merged.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        // Unowned fields preserved.
        assert_eq!(
            pod.priority_class_name.as_deref(),
            Some("system-node-critical")
        );
        assert!(pod.tolerations.is_some());
        // Owned container list reverted.
        assert_eq!(
            pod.containers[0].image_pull_policy.as_deref(),
            Some("IfNotPresent")
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let spec = git_spec(AuthType::None);
        let input = git_input(&spec);
        let desired = build_deployment(&input).unwrap();
        let (merged, changed) = merge_with_existing(desired.clone(), Some(desired)).unwrap();
        assert!(!changed);
        let _ = merged;
    }

    #[test]
    fn autopilot_defaults_mirror_requests_into_limits() {
        let normal = default_resources(RECONCILER_CONTAINER, false);
        let autopilot = default_resources(RECONCILER_CONTAINER, true);
        assert_ne!(normal.limits, autopilot.limits);
        assert_eq!(
            autopilot.requests.as_ref().unwrap().get("cpu"),
            autopilot.limits.as_ref().unwrap().get("cpu")
        );
    }

    #[test]
    fn resource_override_applied() {
        let mut spec = git_spec(AuthType::None);
        spec.override_spec = Some(crate::crd::OverrideSpec {
            resources: vec![crate::crd::ResourceOverride {
                container_name: RECONCILER_CONTAINER.into(),
                cpu_request: Some("200m".into()),
                ..Default::default()
            }],
            ..Default::default()
        });
        let d = build_deployment(&git_input(&spec)).unwrap();
        let pod = d.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let reconciler = pod
            .containers
            .iter()
            .find(|c| c.name == RECONCILER_CONTAINER)
            .unwrap();
        let requests = reconciler
            .resources
            .as_ref()
            .unwrap()
            .requests
            .as_ref()
            .unwrap();
        assert_eq!(requests.get("cpu"), Some(&Quantity("200m".into())));
    }
}
