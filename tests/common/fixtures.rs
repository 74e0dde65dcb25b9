//! Test fixtures and builder patterns for sync objects.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

use kube::core::{DynamicObject, TypeMeta};
use sync_operator::crd::{
    AuthType, GitSpec, RepoSync, RepoSyncSpec, RootSync, RootSyncSpec, Scope, SecretRef,
    SourceFormat, SourceType, SyncSpec,
};
use sync_operator::metadata::{self, StampContext};

/// Builder for creating sync object test fixtures.
///
/// # Example
/// ```
/// let sync = SyncBuilder::root("root-sync")
///     .git("git@github.com:acme/config", "main")
///     .auth(AuthType::Ssh, Some("root-ssh-key"))
///     .build_root();
/// ```
#[derive(Clone, Debug)]
pub struct SyncBuilder {
    name: String,
    namespace: Option<String>,
    spec: SyncSpec,
    generation: Option<i64>,
    finalizers: Vec<String>,
    annotations: BTreeMap<String, String>,
}

impl SyncBuilder {
    /// A cluster-scoped sync fixture.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            spec: SyncSpec::default(),
            generation: Some(1),
            finalizers: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// A namespaced sync fixture.
    pub fn namespaced(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut builder = Self::root(name);
        builder.namespace = Some(namespace.into());
        builder
    }

    pub fn git(mut self, repo: &str, branch: &str) -> Self {
        self.spec.source_type = SourceType::Git;
        self.spec.git = Some(GitSpec {
            repo: repo.to_string(),
            branch: Some(branch.to_string()),
            ..Default::default()
        });
        self
    }

    pub fn dir(mut self, dir: &str) -> Self {
        if let Some(git) = self.spec.git.as_mut() {
            git.dir = Some(dir.to_string());
        }
        self
    }

    pub fn auth(mut self, auth: AuthType, secret: Option<&str>) -> Self {
        if let Some(git) = self.spec.git.as_mut() {
            git.auth = auth;
            git.secret_ref = secret.map(|name| SecretRef {
                name: Some(name.to_string()),
            });
        }
        self
    }

    pub fn source_format(mut self, format: SourceFormat) -> Self {
        self.spec.source_format = format;
        self
    }

    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn finalizer(mut self, finalizer: &str) -> Self {
        self.finalizers.push(finalizer.to_string());
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    fn object_meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: self.namespace.clone(),
            generation: self.generation,
            finalizers: (!self.finalizers.is_empty()).then(|| self.finalizers.clone()),
            annotations: (!self.annotations.is_empty()).then(|| self.annotations.clone()),
            ..Default::default()
        }
    }

    pub fn build_root(self) -> RootSync {
        RootSync {
            metadata: self.object_meta(),
            spec: RootSyncSpec {
                sync: self.spec.clone(),
            },
            status: None,
        }
    }

    pub fn build_repo(self) -> RepoSync {
        RepoSync {
            metadata: self.object_meta(),
            spec: RepoSyncSpec {
                sync: self.spec.clone(),
            },
            status: None,
        }
    }
}

/// A managed DynamicObject stamped the way the parser stamps objects.
pub fn managed_object(
    api_version: &str,
    kind: &str,
    namespace: Option<&str>,
    name: &str,
) -> DynamicObject {
    let mut obj = unmanaged_object(api_version, kind, namespace, name);
    let ctx = StampContext {
        scope: Scope::Root,
        sync_name: "root-sync".to_string(),
        sync_kind: "RootSync",
        source_url: "git@github.com:acme/config".to_string(),
    };
    metadata::stamp(&mut obj, &ctx, "objects.yaml", "abc123");
    obj
}

/// A plain DynamicObject with no management metadata.
pub fn unmanaged_object(
    api_version: &str,
    kind: &str,
    namespace: Option<&str>,
    name: &str,
) -> DynamicObject {
    let mut obj = DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata: Default::default(),
        data: serde_json::json!({"spec": {"replicas": 1}}),
    };
    obj.metadata.name = Some(name.to_string());
    obj.metadata.namespace = namespace.map(String::from);
    obj
}
