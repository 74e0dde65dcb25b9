//! Source descriptors and override blocks shared by RootSync and RepoSync.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{AuthType, NamespaceStrategy, StatusMode};

/// Reference to a secret by name.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Name of the secret in the sync's namespace (or the controller
    /// namespace for RootSync).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl SecretRef {
    /// The referenced secret name, or "" when unset.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// Reference to a ConfigMap by name.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Git source descriptor.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitSpec {
    /// Repository URL (https, ssh, or git protocol).
    pub repo: String,

    /// Branch to sync. Defaults to the remote HEAD branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Revision: a tag, branch, or commit hash. Defaults to HEAD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Subdirectory within the repository to sync. Defaults to the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// How to authenticate against the repository.
    #[serde(default)]
    pub auth: AuthType,

    /// Secret holding the credentials named by `auth`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,

    /// Secret holding a CA certificate (`cert` key) for self-signed HTTPS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_secret_ref: Option<SecretRef>,

    /// Disable TLS verification when fetching.
    #[serde(default)]
    pub no_ssl_verify: bool,

    /// Fetch period in seconds. Defaults to 15.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<i64>,

    /// HTTPS proxy URL used by the fetcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// GCP service account email for `gcpserviceaccount` auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp_service_account_email: Option<String>,
}

impl GitSpec {
    /// The declared revision, defaulting to HEAD.
    pub fn revision(&self) -> &str {
        self.revision.as_deref().unwrap_or("HEAD")
    }

    /// The sync subdirectory, defaulting to the repository root.
    pub fn dir(&self) -> &str {
        self.dir.as_deref().unwrap_or(".")
    }
}

/// OCI source descriptor.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    /// Image URL, optionally with a tag or digest.
    pub image: String,

    /// Subdirectory within the image to sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// How to authenticate against the registry (none, gcenode, gcpserviceaccount).
    #[serde(default)]
    pub auth: AuthType,

    /// Pull period in seconds. Defaults to 15.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<i64>,

    /// GCP service account email for `gcpserviceaccount` auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp_service_account_email: Option<String>,
}

impl OciSpec {
    pub fn dir(&self) -> &str {
        self.dir.as_deref().unwrap_or(".")
    }
}

/// Helm source descriptor.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmSpec {
    /// Chart repository URL (https or oci).
    pub repo: String,

    /// Chart name.
    pub chart: String,

    /// Chart version. Defaults to the latest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Release name used when rendering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Namespace the chart is rendered into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Inline values applied when rendering.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, serde_json::Value>,

    /// Values files within the chart applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_files: Vec<String>,

    /// Whether CRDs in the chart are rendered.
    #[serde(default)]
    pub include_crds: bool,

    /// How to authenticate against the chart repository.
    #[serde(default)]
    pub auth: AuthType,

    /// Secret holding repository credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,

    /// Pull period in seconds. Defaults to 3600.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<i64>,

    /// GCP service account email for `gcpserviceaccount` auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp_service_account_email: Option<String>,
}

/// Resource requests/limits override for one worker container.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverride {
    /// Container name: reconciler, hydration-controller, source-sync, ...
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Log level override for one worker container.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogLevelOverride {
    pub container_name: String,
    pub log_level: i32,
}

/// User overrides of the worker deployment and pipeline timing.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OverrideSpec {
    /// Per-container resource overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceOverride>,

    /// Per-container log level overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_levels: Vec<LogLevelOverride>,

    /// Shallow-clone depth for the git fetcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_sync_depth: Option<i64>,

    /// Bound on waiting for applied objects to become current, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_timeout_seconds: Option<i64>,

    /// Client-side API server timeout, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_timeout_seconds: Option<i64>,

    /// Whether per-object actuation data is written to the inventory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_mode: Option<StatusMode>,

    /// Run the renderer image that ships a shell (for exec-style plugins).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_shell_in_rendering: Option<bool>,

    /// Implicit vs explicit namespace creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_strategy: Option<NamespaceStrategy>,
}

impl OverrideSpec {
    pub const DEFAULT_RECONCILE_TIMEOUT_SECS: i64 = 300;
    pub const DEFAULT_API_SERVER_TIMEOUT_SECS: i64 = 15;

    pub fn reconcile_timeout_secs(&self) -> i64 {
        self.reconcile_timeout_seconds
            .unwrap_or(Self::DEFAULT_RECONCILE_TIMEOUT_SECS)
    }

    pub fn api_server_timeout_secs(&self) -> i64 {
        self.api_server_timeout_seconds
            .unwrap_or(Self::DEFAULT_API_SERVER_TIMEOUT_SECS)
    }

    pub fn status_mode(&self) -> StatusMode {
        self.status_mode.unwrap_or_default()
    }

    pub fn namespace_strategy(&self) -> NamespaceStrategy {
        self.namespace_strategy.unwrap_or_default()
    }
}

/// Subscription configuration for the external notification engine.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    /// ConfigMap holding a `subscriptions` block and trigger templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<ConfigMapRef>,

    /// Secret holding destination credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

/// Spec fields shared by RootSync and RepoSync.
///
/// Exactly one of `git`, `oci`, `helm` must be set and must match
/// `source_type`; the manager validates this before provisioning a worker.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    /// Layout contract of the source tree. Hierarchy is root-only.
    #[serde(default)]
    pub source_format: super::SourceFormat,

    /// Which source descriptor is active.
    #[serde(default)]
    pub source_type: super::SourceType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmSpec>,

    /// User overrides of worker resources and pipeline timing.
    #[serde(default, rename = "override", skip_serializing_if = "Option::is_none")]
    pub override_spec: Option<OverrideSpec>,

    /// Subscription configuration for the notification engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_config: Option<NotificationConfig>,
}

impl SyncSpec {
    /// Overrides with defaults filled in.
    pub fn overrides(&self) -> OverrideSpec {
        self.override_spec.clone().unwrap_or_default()
    }

    /// Auth mode of the active source descriptor.
    pub fn auth(&self) -> AuthType {
        match self.source_type {
            super::SourceType::Git => self.git.as_ref().map(|g| g.auth).unwrap_or_default(),
            super::SourceType::Oci => self.oci.as_ref().map(|o| o.auth).unwrap_or_default(),
            super::SourceType::Helm => self.helm.as_ref().map(|h| h.auth).unwrap_or_default(),
        }
    }

    /// GCP service account email of the active source descriptor.
    pub fn gcp_service_account_email(&self) -> Option<&str> {
        match self.source_type {
            super::SourceType::Git => self
                .git
                .as_ref()
                .and_then(|g| g.gcp_service_account_email.as_deref()),
            super::SourceType::Oci => self
                .oci
                .as_ref()
                .and_then(|o| o.gcp_service_account_email.as_deref()),
            super::SourceType::Helm => self
                .helm
                .as_ref()
                .and_then(|h| h.gcp_service_account_email.as_deref()),
        }
    }

    /// Name of the user-provided auth secret, or "" when auth needs none.
    pub fn auth_secret_name(&self) -> &str {
        let secret_ref = match self.source_type {
            super::SourceType::Git => self.git.as_ref().and_then(|g| g.secret_ref.as_ref()),
            super::SourceType::Helm => self.helm.as_ref().and_then(|h| h.secret_ref.as_ref()),
            super::SourceType::Oci => None,
        };
        secret_ref.map(SecretRef::name).unwrap_or("")
    }

    /// Name of the CA certificate secret, or "" when unset (git only).
    pub fn ca_cert_secret_name(&self) -> &str {
        self.git
            .as_ref()
            .and_then(|g| g.ca_cert_secret_ref.as_ref())
            .map(SecretRef::name)
            .unwrap_or("")
    }

    /// Subdirectory of the source to sync.
    pub fn sync_dir(&self) -> &str {
        match self.source_type {
            super::SourceType::Git => self.git.as_ref().map(GitSpec::dir).unwrap_or("."),
            super::SourceType::Oci => self.oci.as_ref().map(OciSpec::dir).unwrap_or("."),
            super::SourceType::Helm => self
                .helm
                .as_ref()
                .map(|h| h.chart.as_str())
                .unwrap_or("."),
        }
    }

    /// Repository/image/chart-repo URL of the active source descriptor.
    pub fn source_repo(&self) -> &str {
        match self.source_type {
            super::SourceType::Git => self.git.as_ref().map(|g| g.repo.as_str()).unwrap_or(""),
            super::SourceType::Oci => self.oci.as_ref().map(|o| o.image.as_str()).unwrap_or(""),
            super::SourceType::Helm => self.helm.as_ref().map(|h| h.repo.as_str()).unwrap_or(""),
        }
    }

    /// Declared revision (git revision or helm chart version).
    pub fn source_rev(&self) -> &str {
        match self.source_type {
            super::SourceType::Git => self.git.as_ref().map(GitSpec::revision).unwrap_or("HEAD"),
            super::SourceType::Helm => self
                .helm
                .as_ref()
                .and_then(|h| h.version.as_deref())
                .unwrap_or("latest"),
            super::SourceType::Oci => "",
        }
    }

    /// Declared git branch, if any.
    pub fn source_branch(&self) -> Option<&str> {
        self.git.as_ref().and_then(|g| g.branch.as_deref())
    }
}
