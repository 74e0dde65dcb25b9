//! Management metadata stamped on every applied object.
//!
//! The labels identify which sync owns an object (used by the remediator's
//! watch filters and the admission gate); the annotations carry the manager
//! identity, the source coordinates, and the declared-fields snapshot that
//! backs drift detection.

use kube::core::DynamicObject;
use serde_json::Value;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::crd::Scope;
use crate::fieldpath::{self, FieldSet};

/// Label marking an object as managed by this system.
pub const MANAGED_LABEL: &str = "syncoperator.smoketurner.com/managed";
/// Value of [`MANAGED_LABEL`] when management is enabled.
pub const MANAGED_ENABLED: &str = "enabled";
/// Standard Kubernetes managed-by label.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`].
pub const MANAGED_BY_VALUE: &str = "sync-operator";
/// Label carrying the owning sync's namespace (controller namespace for root).
pub const SYNC_NAMESPACE_LABEL: &str = "syncoperator.smoketurner.com/sync-namespace";
/// Label carrying the owning sync's name.
pub const SYNC_NAME_LABEL: &str = "syncoperator.smoketurner.com/sync-name";
/// Label carrying the owning sync's kind (RootSync/RepoSync).
pub const SYNC_KIND_LABEL: &str = "syncoperator.smoketurner.com/sync-kind";
/// Pod label naming the reconciler a worker pod belongs to.
pub const RECONCILER_LABEL: &str = "syncoperator.smoketurner.com/reconciler";

/// Annotation carrying the manager identity `<scope>:<name>`.
pub const RESOURCE_MANAGER_ANNOTATION: &str = "syncoperator.smoketurner.com/resource-manager";
/// Annotation carrying the serialized declared-fields snapshot.
pub const DECLARED_FIELDS_ANNOTATION: &str = "syncoperator.smoketurner.com/declared-fields";
/// Annotation carrying the source URL the object was declared in.
pub const SOURCE_URL_ANNOTATION: &str = "syncoperator.smoketurner.com/source-url";
/// Annotation carrying the path of the declaring file within the source.
pub const SOURCE_PATH_ANNOTATION: &str = "syncoperator.smoketurner.com/source-path";
/// Annotation carrying the stable resource id `<group>_<kind>_<ns>_<name>`.
pub const RESOURCE_ID_ANNOTATION: &str = "syncoperator.smoketurner.com/resource-id";
/// Annotation carrying the source commit the object was last declared at.
pub const TOKEN_ANNOTATION: &str = "syncoperator.smoketurner.com/token";
/// Annotation carrying a hash of the declared configuration body.
pub const LAST_APPLIED_HASH_ANNOTATION: &str = "syncoperator.smoketurner.com/last-applied-hash";
/// Annotation carrying the declared apiVersion (for drift re-apply).
pub const DECLARED_VERSION_ANNOTATION: &str = "syncoperator.smoketurner.com/declared-version";

/// Lifecycle annotation controlling drift checks.
pub const LIFECYCLE_MUTATION_ANNOTATION: &str = "client.lifecycle.config.k8s.io/mutation";
/// Value exempting an object from declared-field drift checks.
pub const IGNORE_MUTATION: &str = "ignore";
/// Lifecycle annotation controlling pruning.
pub const LIFECYCLE_DELETION_ANNOTATION: &str = "client.lifecycle.config.k8s.io/deletion";
/// Value preventing the applier from pruning an object.
pub const PREVENT_DELETION: &str = "detach";

/// Annotation declaring apply-ordering dependencies.
pub const DEPENDS_ON_ANNOTATION: &str = "config.kubernetes.io/depends-on";

/// Bookkeeping annotation written by the notification engine.
pub const NOTIFIED_ANNOTATION: &str = "notified.notifications.argoproj.io";
/// Dotted path of [`NOTIFIED_ANNOTATION`] as it appears in field diffs.
pub const NOTIFIED_FIELD_PATH: &str =
    "metadata.annotations.notified\\.notifications\\.argoproj\\.io";

/// Stable identity of a declared or managed object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize, serde::Serialize)]
pub struct ObjectId {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(group: &str, kind: &str, namespace: &str, name: &str) -> Self {
        ObjectId {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Identity of a dynamic object, if it carries type information.
    pub fn of(obj: &DynamicObject) -> Option<ObjectId> {
        let types = obj.types.as_ref()?;
        let group = types
            .api_version
            .split_once('/')
            .map(|(g, _)| g)
            .unwrap_or("");
        Some(ObjectId {
            group: group.to_string(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name: obj.metadata.name.clone().unwrap_or_default(),
        })
    }

    /// The resource-id annotation form: `<group>_<kind>_<ns>_<name>`,
    /// lowercased, with `<ns>` omitted for cluster-scoped objects.
    pub fn resource_id(&self) -> String {
        let group = if self.group.is_empty() { "" } else { &self.group };
        let kind = self.kind.to_lowercase();
        if self.namespace.is_empty() {
            format!("{group}_{kind}_{}", self.name)
        } else {
            format!("{group}_{kind}_{}_{}", self.namespace, self.name)
        }
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}.{}/{}", self.kind, self.group, self.name)
        } else {
            write!(f, "{}.{}/{}/{}", self.kind, self.group, self.namespace, self.name)
        }
    }
}

fn annotations(obj: &DynamicObject) -> Option<&BTreeMap<String, String>> {
    obj.metadata.annotations.as_ref()
}

/// Read an annotation off a dynamic object.
pub fn get_annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    annotations(obj).and_then(|a| a.get(key)).map(String::as_str)
}

/// Read a label off a dynamic object.
pub fn get_label<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// Set an annotation on a dynamic object.
pub fn set_annotation(obj: &mut DynamicObject, key: &str, value: &str) {
    obj.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Set a label on a dynamic object.
pub fn set_label(obj: &mut DynamicObject, key: &str, value: &str) {
    obj.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Whether the object carries the management-enabled label.
pub fn is_managed(obj: &DynamicObject) -> bool {
    get_label(obj, MANAGED_LABEL) == Some(MANAGED_ENABLED)
}

/// The manager identity recorded on the object, or "" when unmanaged.
pub fn manager_of(obj: &DynamicObject) -> &str {
    get_annotation(obj, RESOURCE_MANAGER_ANNOTATION).unwrap_or("")
}

/// Whether the object opted out of drift enforcement.
pub fn ignores_mutation(obj: &DynamicObject) -> bool {
    get_annotation(obj, LIFECYCLE_MUTATION_ANNOTATION) == Some(IGNORE_MUTATION)
}

/// Whether the object is protected from pruning.
pub fn prevents_deletion(obj: &DynamicObject) -> bool {
    get_annotation(obj, LIFECYCLE_DELETION_ANNOTATION) == Some(PREVENT_DELETION)
}

/// The declared-fields snapshot recorded on the object, if parseable.
pub fn declared_fields(obj: &DynamicObject) -> Option<FieldSet> {
    let raw = get_annotation(obj, DECLARED_FIELDS_ANNOTATION)?;
    FieldSet::from_json(raw).ok()
}

/// Identification of the sync stamping objects: scope, name, and source.
#[derive(Clone, Debug)]
pub struct StampContext {
    pub scope: Scope,
    pub sync_name: String,
    pub sync_kind: &'static str,
    pub source_url: String,
}

impl StampContext {
    /// The manager identity this context stamps.
    pub fn manager(&self) -> String {
        self.scope.manager(&self.sync_name)
    }

    /// The namespace recorded in the sync-namespace label.
    pub fn sync_namespace(&self) -> &str {
        match &self.scope {
            Scope::Root => crate::crd::CONTROLLER_NAMESPACE,
            Scope::Namespace(ns) => ns,
        }
    }
}

fn config_hash(obj: &DynamicObject) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    serde_json::to_string(&obj.data)
        .unwrap_or_default()
        .hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Stamp management metadata onto a declared object.
///
/// The declared-fields snapshot is computed from the object as declared in
/// source (including the metadata stamped here), so stamping must happen
/// after any other mutation of the declared form.
pub fn stamp(obj: &mut DynamicObject, ctx: &StampContext, source_path: &str, commit: &str) {
    set_label(obj, MANAGED_LABEL, MANAGED_ENABLED);
    set_label(obj, MANAGED_BY_LABEL, MANAGED_BY_VALUE);
    set_label(obj, SYNC_NAMESPACE_LABEL, ctx.sync_namespace());
    set_label(obj, SYNC_NAME_LABEL, &ctx.sync_name);
    set_label(obj, SYNC_KIND_LABEL, ctx.sync_kind);

    set_annotation(obj, RESOURCE_MANAGER_ANNOTATION, &ctx.manager());
    set_annotation(obj, SOURCE_URL_ANNOTATION, &ctx.source_url);
    set_annotation(obj, SOURCE_PATH_ANNOTATION, source_path);
    if let Some(id) = ObjectId::of(obj) {
        set_annotation(obj, RESOURCE_ID_ANNOTATION, &id.resource_id());
    }
    set_annotation(obj, TOKEN_ANNOTATION, commit);
    set_annotation(obj, LAST_APPLIED_HASH_ANNOTATION, &config_hash(obj));
    if let Some(types) = obj.types.clone() {
        set_annotation(obj, DECLARED_VERSION_ANNOTATION, &types.api_version);
    }

    // Snapshot last: it must cover the stamped metadata too, so the gate
    // protects the labels and annotations themselves.
    let snapshot = declared_field_snapshot(obj);
    set_annotation(obj, DECLARED_FIELDS_ANNOTATION, &snapshot.to_json());
}

/// Compute the declared-fields snapshot for an object: every leaf path of
/// its declared form except status and server-managed metadata.
pub fn declared_field_snapshot(obj: &DynamicObject) -> FieldSet {
    let mut value = serde_json::to_value(obj).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("status");
        if let Some(Value::Object(meta)) = map.get_mut("metadata") {
            for volatile in [
                "creationTimestamp",
                "generation",
                "managedFields",
                "resourceVersion",
                "uid",
            ] {
                meta.remove(volatile);
            }
            // The snapshot itself would otherwise change every time it is
            // recomputed over the stamped object.
            if let Some(Value::Object(ann)) = meta.get_mut("annotations") {
                ann.remove(DECLARED_FIELDS_ANNOTATION);
            }
        }
    }
    fieldpath::leaf_paths(&value)
}

/// The field paths making up the management metadata itself. Any external
/// update touching these is rejected outright by the admission gate.
pub fn management_metadata_paths() -> FieldSet {
    let escape = |s: &str| s.replace('.', "\\.");
    [
        format!("metadata.labels.{}", escape(MANAGED_LABEL)),
        format!("metadata.labels.{}", escape(MANAGED_BY_LABEL)),
        format!("metadata.annotations.{}", escape(RESOURCE_MANAGER_ANNOTATION)),
        format!("metadata.annotations.{}", escape(DECLARED_FIELDS_ANNOTATION)),
        format!("metadata.annotations.{}", escape(RESOURCE_ID_ANNOTATION)),
    ]
    .into_iter()
    .collect()
}

/// Escape a metadata key for use as a single field-path segment.
pub fn escape_key(key: &str) -> String {
    key.replace('.', "\\.")
}
