//! Custom Resource Definitions for the sync operator.
//!
//! Two sync kinds share one spec/status shape: the cluster-scoped `RootSync`
//! for cluster-wide configuration and the namespaced `RepoSync` for tenant
//! namespaces. The shared pieces (source descriptors, overrides, status
//! blocks, conditions) live in `source` and `status`.

pub mod repo_sync;
pub mod root_sync;
pub mod source;
pub mod status;

pub use repo_sync::{RepoSync, RepoSyncSpec};
pub use root_sync::{RootSync, RootSyncSpec};
pub use source::{
    ConfigMapRef, GitSpec, HelmSpec, NotificationConfig, OciSpec, OverrideSpec, ResourceOverride,
    SecretRef, SyncSpec,
};
pub use status::{
    ConfigSyncError, ErrorSummary, GitSourceStatus, HelmSourceStatus, OciSourceStatus,
    RenderingStatus, SourceStatus, SyncCondition, SyncConditionType, SyncStatus, SyncStatusBlock,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group for all sync-operator resources.
pub const API_GROUP: &str = "syncoperator.smoketurner.com";

/// Namespace where the operator and all reconciler workers run.
pub const CONTROLLER_NAMESPACE: &str = "sync-operator-system";

/// Name of the default cluster-scoped sync object.
pub const ROOT_SYNC_NAME: &str = "root-sync";

/// Name of the default namespace-scoped sync object.
pub const REPO_SYNC_NAME: &str = "repo-sync";

/// Finalizer placed on every sync object before its worker is provisioned.
pub const FINALIZER: &str = "syncoperator.smoketurner.com/reconciler-manager";

/// Where the declared configuration comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// A git repository, mirrored by the source-sync sidecar.
    #[default]
    Git,
    /// An OCI image containing configuration layers.
    Oci,
    /// A Helm chart, rendered by the hydration controller.
    Helm,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Git => write!(f, "git"),
            SourceType::Oci => write!(f, "oci"),
            SourceType::Helm => write!(f, "helm"),
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(SourceType::Git),
            "oci" => Ok(SourceType::Oci),
            "helm" => Ok(SourceType::Helm),
            other => Err(format!("unknown source type {other:?}")),
        }
    }
}

/// How the fetcher authenticates against the source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// No credentials (public sources).
    #[default]
    None,
    /// SSH private key from the referenced secret.
    Ssh,
    /// Git cookiefile from the referenced secret.
    Cookiefile,
    /// Bearer token (username + token keys) from the referenced secret.
    Token,
    /// Credentials minted by the node's metadata service.
    #[serde(rename = "gcenode")]
    GceNode,
    /// Federated workload identity against a GCP service account.
    #[serde(rename = "gcpserviceaccount")]
    GcpServiceAccount,
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthType::None => "none",
            AuthType::Ssh => "ssh",
            AuthType::Cookiefile => "cookiefile",
            AuthType::Token => "token",
            AuthType::GceNode => "gcenode",
            AuthType::GcpServiceAccount => "gcpserviceaccount",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(AuthType::None),
            "ssh" => Ok(AuthType::Ssh),
            "cookiefile" => Ok(AuthType::Cookiefile),
            "token" => Ok(AuthType::Token),
            "gcenode" => Ok(AuthType::GceNode),
            "gcpserviceaccount" => Ok(AuthType::GcpServiceAccount),
            other => Err(format!("unknown auth type {other:?}")),
        }
    }
}

impl AuthType {
    /// Whether this auth mode reads credentials from a user-provided secret.
    pub fn requires_secret(self) -> bool {
        matches!(self, AuthType::Ssh | AuthType::Cookiefile | AuthType::Token)
    }

    /// The key that must be present in the referenced secret.
    pub fn required_secret_key(self) -> Option<&'static str> {
        match self {
            AuthType::Ssh => Some("ssh"),
            AuthType::Cookiefile => Some("cookie_file"),
            AuthType::Token => Some("token"),
            _ => None,
        }
    }
}

/// Layout contract of the source tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Directory structure dictates object scope (root syncs only).
    Hierarchy,
    /// Any layout; objects validated flat.
    #[default]
    Unstructured,
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFormat::Hierarchy => write!(f, "hierarchy"),
            SourceFormat::Unstructured => write!(f, "unstructured"),
        }
    }
}

impl std::str::FromStr for SourceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hierarchy" => Ok(SourceFormat::Hierarchy),
            "unstructured" | "" => Ok(SourceFormat::Unstructured),
            other => Err(format!("unknown source format {other:?}")),
        }
    }
}

/// Whether the parser synthesizes namespaces referenced but not declared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceStrategy {
    /// Referenced namespaces are created implicitly with a prevent-deletion marker.
    #[default]
    Implicit,
    /// Namespaces must be declared in the source.
    Explicit,
}

impl std::fmt::Display for NamespaceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamespaceStrategy::Implicit => write!(f, "implicit"),
            NamespaceStrategy::Explicit => write!(f, "explicit"),
        }
    }
}

/// Whether the applier records per-object actuation data in the inventory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StatusMode {
    #[default]
    Enabled,
    Disabled,
}

impl std::fmt::Display for StatusMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusMode::Enabled => write!(f, "enabled"),
            StatusMode::Disabled => write!(f, "disabled"),
        }
    }
}

/// The scope a reconciler operates in: the whole cluster or one namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Root,
    Namespace(String),
}

impl Scope {
    /// Parse the `SCOPE` environment value (`:root` or a namespace name).
    pub fn parse(s: &str) -> Scope {
        if s == ":root" {
            Scope::Root
        } else {
            Scope::Namespace(s.to_string())
        }
    }

    /// The manager identity recorded on managed objects: `<scope>:<name>`.
    pub fn manager(&self, sync_name: &str) -> String {
        match self {
            Scope::Root => format!(":root:{sync_name}"),
            Scope::Namespace(ns) => format!("{ns}:{sync_name}"),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Root => write!(f, ":root"),
            Scope::Namespace(ns) => write!(f, "{ns}"),
        }
    }
}

/// Uniform access to RootSync and RepoSync for code that is generic over the
/// two kinds (the manager controllers and the reconciler's status surface).
pub trait SyncApi:
    kube::Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Kind string, e.g. "RootSync".
    fn sync_kind() -> &'static str;

    /// An Api handle appropriate for the given sync scope.
    fn scoped_api(client: kube::Client, scope: &Scope) -> kube::Api<Self>;

    /// The scope this object reconciles in.
    fn scope_of(&self) -> Scope;

    fn sync_spec(&self) -> &SyncSpec;

    fn sync_status(&self) -> Option<&SyncStatus>;

    /// Mutable status, initialized to the default when absent.
    fn sync_status_mut(&mut self) -> &mut SyncStatus;
}
