//! Object validation for both source formats.
//!
//! Hierarchy mode (root only) derives scope from the directory layout and
//! requires the `system/repo.yaml` marker. Unstructured mode validates the
//! flat object list. Blocking errors short-circuit the pipeline before
//! apply; non-blocking ones ride along into status.

use std::collections::{BTreeMap, BTreeSet};

use kube::core::DynamicObject;

use crate::crd::{API_GROUP, CONTROLLER_NAMESPACE, Scope};
use crate::errors::{StatusError, codes};
use crate::metadata::ObjectId;
use crate::reconciler::parse::reader::FileObject;

/// Kinds that may never be declared in a source.
///
/// The sync kinds themselves are declarable (a RootSync may manage other
/// sync objects); everything else in the operator's group is internal.
fn is_forbidden(id: &ObjectId) -> bool {
    id.group == API_GROUP && id.kind != "RootSync" && id.kind != "RepoSync"
}

/// Builtin cluster-scoped kinds; extended by CRDs declared in the tree.
const CLUSTER_SCOPED_KINDS: [&str; 12] = [
    "APIService",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
];

/// Scope knowledge assembled from builtins plus in-tree CRDs.
pub struct Scoper {
    cluster_scoped: BTreeSet<String>,
    namespaced: BTreeSet<String>,
}

impl Scoper {
    /// Build from the declared objects, reading scope from in-tree CRDs.
    pub fn from_declared(objects: &[FileObject]) -> Scoper {
        let mut cluster_scoped: BTreeSet<String> = CLUSTER_SCOPED_KINDS
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut namespaced = BTreeSet::new();
        for fo in objects {
            let Some(types) = &fo.object.types else { continue };
            if types.kind != "CustomResourceDefinition" {
                continue;
            }
            let spec = &fo.object.data["spec"];
            let kind = spec["names"]["kind"].as_str().unwrap_or_default().to_string();
            if kind.is_empty() {
                continue;
            }
            match spec["scope"].as_str() {
                Some("Cluster") => {
                    cluster_scoped.insert(kind);
                }
                _ => {
                    namespaced.insert(kind);
                }
            }
        }
        Scoper {
            cluster_scoped,
            namespaced,
        }
    }

    /// Whether the kind is namespaced; None when unknown.
    pub fn is_namespaced(&self, kind: &str) -> Option<bool> {
        if self.cluster_scoped.contains(kind) {
            Some(false)
        } else if self.namespaced.contains(kind) {
            Some(true)
        } else {
            // Core and workload kinds not in the cluster-scoped table are
            // namespaced; truly unknown kinds are resolved optimistically
            // the same way, matching server-side behavior for CRs whose CRD
            // already exists in the cluster.
            Some(true)
        }
    }
}

/// What the validator needs to know about the sync it runs for.
pub struct ValidateOptions {
    pub scope: Scope,
    pub sync_name: String,
}

fn object_id(obj: &DynamicObject) -> Result<ObjectId, StatusError> {
    ObjectId::of(obj).ok_or_else(|| {
        StatusError::validation(
            codes::PARSE_ERROR,
            format!(
                "object {:?} has no apiVersion/kind",
                obj.metadata.name.as_deref().unwrap_or("")
            ),
        )
    })
}

/// Validate the flat object list (unstructured mode; also the second half
/// of hierarchy mode). Mutates objects to fill defaulted namespaces.
pub fn validate_objects(
    objects: &mut [FileObject],
    opts: &ValidateOptions,
) -> Vec<StatusError> {
    let mut errs = Vec::new();
    let scoper = Scoper::from_declared(objects);
    let mut seen: BTreeMap<ObjectId, String> = BTreeMap::new();

    for fo in objects.iter_mut() {
        let id = match object_id(&fo.object) {
            Ok(id) => id,
            Err(e) => {
                errs.push(e);
                continue;
            }
        };

        if is_forbidden(&id) {
            errs.push(StatusError::validation(
                codes::FORBIDDEN_KIND,
                format!("declaring {id} is not allowed: {}/{} objects are internal", id.group, id.kind),
            ));
            continue;
        }

        // Self-management deadlocks the pipeline against the admission gate.
        if id.group == API_GROUP && id.name == opts.sync_name {
            let is_self = match &opts.scope {
                Scope::Root => id.kind == "RootSync",
                Scope::Namespace(ns) => id.kind == "RepoSync" && id.namespace == *ns,
            };
            if is_self {
                errs.push(StatusError::validation(
                    codes::SELF_MANAGEMENT,
                    format!(
                        "{id} cannot declare itself in its own source of truth; \
                         remove it from the repository"
                    ),
                ));
                continue;
            }
        }

        match (&opts.scope, scoper.is_namespaced(&id.kind)) {
            (Scope::Namespace(ns), Some(true)) => {
                match fo.object.metadata.namespace.as_deref() {
                    None | Some("") => {
                        fo.object.metadata.namespace = Some(ns.clone());
                    }
                    Some(actual) if actual != ns => {
                        errs.push(StatusError::validation(
                            codes::SCOPE_VIOLATION,
                            format!(
                                "{id} declares namespace {actual:?} but this RepoSync only \
                                 manages namespace {ns:?}"
                            ),
                        ));
                        continue;
                    }
                    Some(_) => {}
                }
            }
            (Scope::Namespace(_), Some(false)) => {
                errs.push(StatusError::validation(
                    codes::SCOPE_VIOLATION,
                    format!("cluster-scoped object {id} is not allowed in a namespace repository"),
                ));
                continue;
            }
            (Scope::Root, Some(false)) => {
                if fo.object.metadata.namespace.is_some() {
                    errs.push(StatusError::validation(
                        codes::SCOPE_VIOLATION,
                        format!("cluster-scoped object {id} must not declare a namespace"),
                    ));
                    continue;
                }
            }
            _ => {}
        }

        // Re-derive the identity after namespace defaulting for dedup.
        let id = match object_id(&fo.object) {
            Ok(id) => id,
            Err(e) => {
                errs.push(e);
                continue;
            }
        };
        if let Some(previous) = seen.insert(id.clone(), fo.path.clone()) {
            errs.push(StatusError::validation(
                codes::DUPLICATE_OBJECT,
                format!("duplicate object {id} declared in {previous} and {}", fo.path),
            ));
        }
    }

    errs
}

/// Top-level directories allowed in hierarchy mode.
const HIERARCHY_DIRS: [&str; 3] = ["cluster", "namespaces", "system"];

/// Validate hierarchy-mode layout and derive namespaces from paths.
///
/// Returns the objects surviving layout validation (the `system/` marker
/// objects are consumed here and not applied).
pub fn validate_hierarchy(
    objects: Vec<FileObject>,
    opts: &ValidateOptions,
) -> (Vec<FileObject>, Vec<StatusError>) {
    let mut errs = Vec::new();
    let mut kept = Vec::new();
    let mut repo_marker_found = false;

    for mut fo in objects {
        let top = fo.path.split('/').next().unwrap_or("").to_string();
        let segments: Vec<String> = fo.path.split('/').map(String::from).collect();

        if !HIERARCHY_DIRS.contains(&top.as_str()) {
            errs.push(StatusError::validation(
                codes::SCOPE_VIOLATION,
                format!(
                    "{} is outside the allowed hierarchy directories ({}); move it under one of them",
                    fo.path,
                    HIERARCHY_DIRS.join(", ")
                ),
            ));
            continue;
        }

        match top.as_str() {
            "system" => {
                if fo.object.types.as_ref().is_some_and(|t| t.kind == "Repo") {
                    repo_marker_found = true;
                }
                // system/ holds markers and defaults, never applied objects.
                continue;
            }
            "namespaces" => {
                // namespaces/<ns>/<file> scopes objects to <ns>.
                if segments.len() < 3 {
                    // A file directly under namespaces/ declares abstract
                    // config; only Namespace objects make sense there.
                    errs.push(StatusError::validation(
                        codes::SCOPE_VIOLATION,
                        format!("{} must live under namespaces/<namespace>/", fo.path),
                    ));
                    continue;
                }
                let dir_ns = segments[1].clone();
                let is_namespace_object = fo
                    .object
                    .types
                    .as_ref()
                    .is_some_and(|t| t.kind == "Namespace");
                if is_namespace_object {
                    if fo.object.metadata.name.as_deref() != Some(dir_ns.as_str()) {
                        errs.push(StatusError::validation(
                            codes::SCOPE_VIOLATION,
                            format!(
                                "Namespace in {} must be named {dir_ns:?} to match its directory",
                                fo.path
                            ),
                        ));
                        continue;
                    }
                } else {
                    match fo.object.metadata.namespace.as_deref() {
                        None | Some("") => fo.object.metadata.namespace = Some(dir_ns),
                        Some(actual) if actual != dir_ns => {
                            errs.push(StatusError::validation(
                                codes::SCOPE_VIOLATION,
                                format!(
                                    "object in {} declares namespace {actual:?} but its \
                                     directory implies {dir_ns:?}",
                                    fo.path
                                ),
                            ));
                            continue;
                        }
                        Some(_) => {}
                    }
                }
                kept.push(fo);
            }
            "cluster" => {
                if fo.object.metadata.namespace.is_some() {
                    errs.push(StatusError::validation(
                        codes::SCOPE_VIOLATION,
                        format!("object in {} under cluster/ must not declare a namespace", fo.path),
                    ));
                    continue;
                }
                kept.push(fo);
            }
            _ => unreachable!("filtered above"),
        }
    }

    if !repo_marker_found {
        errs.push(StatusError::validation(
            codes::MISSING_REPO,
            "the repository must declare a Repo object at system/repo.yaml".to_string(),
        ));
    }

    let mut flat_errs = validate_objects(&mut kept, opts);
    errs.append(&mut flat_errs);
    (kept, errs)
}

/// Namespaces referenced by namespaced objects but not declared.
pub fn undeclared_namespaces(objects: &[FileObject]) -> BTreeSet<String> {
    let mut declared = BTreeSet::new();
    let mut referenced = BTreeSet::new();
    for fo in objects {
        let is_namespace = fo
            .object
            .types
            .as_ref()
            .is_some_and(|t| t.kind == "Namespace");
        if is_namespace {
            if let Some(name) = &fo.object.metadata.name {
                declared.insert(name.clone());
            }
        } else if let Some(ns) = &fo.object.metadata.namespace
            && !ns.is_empty()
        {
            referenced.insert(ns.clone());
        }
    }
    referenced
        .into_iter()
        // The controller namespace is never synthesized: managing it from a
        // sync would make every root sync fight over it.
        .filter(|ns| !declared.contains(ns) && ns != CONTROLLER_NAMESPACE)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::TypeMeta;

    fn file_object(api_version: &str, kind: &str, ns: Option<&str>, name: &str, path: &str) -> FileObject {
        let mut object = DynamicObject {
            types: Some(TypeMeta {
                api_version: api_version.into(),
                kind: kind.into(),
            }),
            metadata: Default::default(),
            data: serde_json::json!({}),
        };
        object.metadata.name = Some(name.into());
        object.metadata.namespace = ns.map(String::from);
        FileObject {
            object,
            path: path.into(),
        }
    }

    fn root_opts() -> ValidateOptions {
        ValidateOptions {
            scope: Scope::Root,
            sync_name: "root-sync".into(),
        }
    }

    fn ns_opts(ns: &str) -> ValidateOptions {
        ValidateOptions {
            scope: Scope::Namespace(ns.into()),
            sync_name: "repo-sync".into(),
        }
    }

    #[test]
    fn duplicate_identity_is_blocking() {
        let mut objs = vec![
            file_object("v1", "ConfigMap", Some("app"), "settings", "a.yaml"),
            file_object("v1", "ConfigMap", Some("app"), "settings", "b.yaml"),
        ];
        let errs = validate_objects(&mut objs, &root_opts());
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].code(), codes::DUPLICATE_OBJECT);
        assert!(errs[0].is_blocking());
    }

    #[test]
    fn repo_sync_defaults_and_enforces_namespace() {
        let mut objs = vec![
            file_object("v1", "ConfigMap", None, "defaulted", "a.yaml"),
            file_object("v1", "ConfigMap", Some("other"), "escape", "b.yaml"),
        ];
        let errs = validate_objects(&mut objs, &ns_opts("tenant-a"));
        assert_eq!(objs[0].object.metadata.namespace.as_deref(), Some("tenant-a"));
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].code(), codes::SCOPE_VIOLATION);
    }

    #[test]
    fn cluster_scoped_object_rejected_in_namespace_repo() {
        let mut objs = vec![file_object(
            "rbac.authorization.k8s.io/v1",
            "ClusterRole",
            None,
            "admin",
            "role.yaml",
        )];
        let errs = validate_objects(&mut objs, &ns_opts("tenant-a"));
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].code(), codes::SCOPE_VIOLATION);
    }

    #[test]
    fn self_management_is_rejected() {
        let mut objs = vec![file_object(
            "syncoperator.smoketurner.com/v1beta1",
            "RootSync",
            None,
            "root-sync",
            "rs.yaml",
        )];
        let errs = validate_objects(&mut objs, &root_opts());
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].code(), codes::SELF_MANAGEMENT);
    }

    #[test]
    fn other_sync_objects_are_declarable() {
        let mut objs = vec![file_object(
            "syncoperator.smoketurner.com/v1beta1",
            "RepoSync",
            Some("tenant-a"),
            "repo-sync",
            "rs.yaml",
        )];
        let errs = validate_objects(&mut objs, &root_opts());
        assert!(errs.is_empty(), "{errs:?}");
    }

    #[test]
    fn hierarchy_requires_repo_marker() {
        let objs = vec![file_object(
            "v1",
            "ConfigMap",
            None,
            "cm",
            "namespaces/app/cm.yaml",
        )];
        let (_, errs) = validate_hierarchy(objs, &root_opts());
        assert!(errs.iter().any(|e| e.code() == codes::MISSING_REPO));
    }

    #[test]
    fn hierarchy_scopes_by_directory() {
        let objs = vec![
            file_object(
                "syncoperator.smoketurner.com/v1",
                "Repo",
                None,
                "repo",
                "system/repo.yaml",
            ),
            file_object("v1", "ConfigMap", None, "cm", "namespaces/app/cm.yaml"),
            file_object(
                "rbac.authorization.k8s.io/v1",
                "ClusterRole",
                None,
                "reader",
                "cluster/role.yaml",
            ),
        ];
        let (kept, errs) = validate_hierarchy(objs, &root_opts());
        assert!(errs.is_empty(), "{errs:?}");
        // The Repo marker is consumed, not applied.
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].object.metadata.namespace.as_deref(), Some("app"));
    }

    #[test]
    fn hierarchy_rejects_top_level_files() {
        let objs = vec![
            file_object(
                "syncoperator.smoketurner.com/v1",
                "Repo",
                None,
                "repo",
                "system/repo.yaml",
            ),
            file_object("v1", "ConfigMap", None, "cm", "cm.yaml"),
        ];
        let (_, errs) = validate_hierarchy(objs, &root_opts());
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].code(), codes::SCOPE_VIOLATION);
    }

    #[test]
    fn undeclared_namespaces_skips_declared_and_controller_ns() {
        let objs = vec![
            file_object("v1", "Namespace", None, "declared", "ns.yaml"),
            file_object("v1", "ConfigMap", Some("declared"), "a", "a.yaml"),
            file_object("v1", "ConfigMap", Some("implicit"), "b", "b.yaml"),
            file_object("v1", "ConfigMap", Some(CONTROLLER_NAMESPACE), "c", "c.yaml"),
        ];
        let undeclared = undeclared_namespaces(&objs);
        assert_eq!(undeclared.len(), 1);
        assert!(undeclared.contains("implicit"));
    }

    #[test]
    fn crd_scope_extends_scoper() {
        let mut crd = file_object(
            "apiextensions.k8s.io/v1",
            "CustomResourceDefinition",
            None,
            "widgets.example.com",
            "crd.yaml",
        );
        crd.object.data = serde_json::json!({
            "spec": {"scope": "Cluster", "names": {"kind": "Widget"}}
        });
        let scoper = Scoper::from_declared(&[crd]);
        assert_eq!(scoper.is_namespaced("Widget"), Some(false));
        assert_eq!(scoper.is_namespaced("Deployment"), Some(true));
        assert_eq!(scoper.is_namespaced("Namespace"), Some(false));
    }
}
