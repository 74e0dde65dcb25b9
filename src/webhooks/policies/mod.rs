//! Admission policy for objects under management.
//!
//! The gate never owns objects; it arbitrates field changes:
//! - Reconciler service accounts may only touch objects their own sync
//!   manages (a mismatched manager annotation is unauthorized).
//! - Other principals may not create or delete managed objects, and may
//!   not update fields inside the declared-fields snapshot or the
//!   management metadata itself.
//! - `lifecycle mutation: ignore` exempts an object from declared-field
//!   checks but not from metadata protection.

use kube::core::DynamicObject;
use kube::core::admission::Operation;

use crate::crd::{CONTROLLER_NAMESPACE, Scope};
use crate::fieldpath::{self, FieldSet};
use crate::manager::names;
use crate::metadata;

/// Denial reason, mapped onto the AdmissionReview status reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenyReason {
    Forbidden,
    Unauthorized,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::Forbidden => "Forbidden",
            DenyReason::Unauthorized => "Unauthorized",
        }
    }
}

/// Result of a validation check
#[derive(Debug)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    pub fn denied(reason: DenyReason, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            message: Some(message.into()),
        }
    }
}

/// Context for one admission request.
pub struct AdmissionContext<'a> {
    pub operation: Operation,
    pub username: &'a str,
    pub old_object: Option<&'a DynamicObject>,
    pub new_object: Option<&'a DynamicObject>,
}

impl<'a> AdmissionContext<'a> {
    fn any_object(&self) -> Option<&'a DynamicObject> {
        self.old_object.or(self.new_object)
    }

    fn object_description(&self) -> String {
        self.any_object()
            .and_then(metadata::ObjectId::of)
            .map(|id| id.to_string())
            .unwrap_or_else(|| "object".to_string())
    }
}

/// The service-account name when the caller is one of our reconcilers.
fn reconciler_service_account(username: &str) -> Option<&str> {
    let rest = username.strip_prefix("system:serviceaccount:")?;
    let (namespace, name) = rest.split_once(':')?;
    if namespace != CONTROLLER_NAMESPACE {
        return None;
    }
    names::is_reconciler_resource(name).then_some(name)
}

/// The reconciler that serves a manager identity `<scope>:<name>`.
fn reconciler_for_manager(manager: &str) -> Option<String> {
    if let Some(name) = manager.strip_prefix(":root:") {
        return Some(names::reconciler_name(&Scope::Root, name));
    }
    let (ns, name) = manager.split_once(':')?;
    if ns.is_empty() || name.is_empty() {
        return None;
    }
    Some(names::reconciler_name(&Scope::Namespace(ns.to_string()), name))
}

fn manager_of_either(ctx: &AdmissionContext<'_>) -> String {
    let from_old = ctx.old_object.map(metadata::manager_of).unwrap_or("");
    if !from_old.is_empty() {
        return from_old.to_string();
    }
    ctx.new_object
        .map(metadata::manager_of)
        .unwrap_or("")
        .to_string()
}

fn diff_set(ctx: &AdmissionContext<'_>) -> Option<FieldSet> {
    let old = serde_json::to_value(ctx.old_object?).ok()?;
    let new = serde_json::to_value(ctx.new_object?).ok()?;
    Some(fieldpath::diff_paths(&old, &new))
}

/// Whether an update's only change is the notification bookkeeping
/// annotation the notification engine maintains on sync objects.
fn only_notified_annotation(ctx: &AdmissionContext<'_>) -> bool {
    match diff_set(ctx) {
        Some(diff) => {
            diff.len() == 1
                && diff.contains(metadata::NOTIFIED_FIELD_PATH)
        }
        None => false,
    }
}

fn validate_system_caller(ctx: &AdmissionContext<'_>, sa_name: &str) -> ValidationResult {
    if ctx.operation == Operation::Update && only_notified_annotation(ctx) {
        return ValidationResult::allowed();
    }

    let manager = manager_of_either(ctx);
    if manager.is_empty() {
        // Reconcilers freely manage unmanaged objects (first apply).
        return ValidationResult::allowed();
    }
    match reconciler_for_manager(&manager) {
        Some(expected) if expected == sa_name => ValidationResult::allowed(),
        Some(_) | None => ValidationResult::denied(
            DenyReason::Unauthorized,
            format!(
                "{sa_name} is not authorized to {} the object {} managed by {manager:?}",
                operation_verb(ctx.operation.clone()),
                ctx.object_description()
            ),
        ),
    }
}

fn operation_verb(op: Operation) -> &'static str {
    match op {
        Operation::Create => "create",
        Operation::Update => "update",
        Operation::Delete => "delete",
        Operation::Connect => "connect to",
    }
}

fn validate_create(ctx: &AdmissionContext<'_>) -> ValidationResult {
    match ctx.new_object {
        Some(new) if metadata::is_managed(new) => ValidationResult::denied(
            DenyReason::Unauthorized,
            format!(
                "{} is not authorized to create managed resource {}",
                ctx.username,
                ctx.object_description()
            ),
        ),
        _ => ValidationResult::allowed(),
    }
}

fn validate_delete(ctx: &AdmissionContext<'_>) -> ValidationResult {
    let Some(old) = ctx.old_object else {
        return ValidationResult::allowed();
    };
    // A delete already accepted but not yet complete shows up again while
    // finalizers run; re-denying it would wedge the object.
    if old.metadata.deletion_timestamp.is_some() {
        return ValidationResult::allowed();
    }
    if metadata::is_managed(old) {
        return ValidationResult::denied(
            DenyReason::Unauthorized,
            format!(
                "{} is not authorized to delete managed resource {}",
                ctx.username,
                ctx.object_description()
            ),
        );
    }
    ValidationResult::allowed()
}

fn validate_update(ctx: &AdmissionContext<'_>) -> ValidationResult {
    let (Some(old), Some(new)) = (ctx.old_object, ctx.new_object) else {
        return ValidationResult::allowed();
    };
    if !metadata::is_managed(old) && !metadata::is_managed(new) {
        // The webhook is configured to only intercept managed objects, so
        // this is a race against unmanagement; nothing to protect.
        return ValidationResult::allowed();
    }

    let Some(diff) = diff_set(ctx) else {
        return ValidationResult::allowed();
    };

    // Management metadata is protected even for ignore-mutation objects.
    let metadata_touches = diff.intersection(&metadata::management_metadata_paths());
    if !metadata_touches.is_empty() {
        return ValidationResult::denied(
            DenyReason::Forbidden,
            format!(
                "{} cannot modify the management metadata of object {}: {}",
                ctx.username,
                ctx.object_description(),
                metadata_touches
            ),
        );
    }

    if metadata::ignores_mutation(old) {
        return ValidationResult::allowed();
    }

    let Some(declared) = metadata::declared_fields(old) else {
        // No parseable snapshot: nothing more to enforce.
        return ValidationResult::allowed();
    };
    let disputed = diff.intersection(&declared);
    if !disputed.is_empty() {
        return ValidationResult::denied(
            DenyReason::Forbidden,
            format!(
                "{} cannot modify fields of object {} managed by {:?}: {}",
                ctx.username,
                ctx.object_description(),
                manager_of_either(ctx),
                disputed
            ),
        );
    }
    ValidationResult::allowed()
}

/// Run the full admission policy for one request.
pub fn validate(ctx: &AdmissionContext<'_>) -> ValidationResult {
    if let Some(sa_name) = reconciler_service_account(ctx.username) {
        return validate_system_caller(ctx, sa_name);
    }

    match ctx.operation {
        Operation::Create => validate_create(ctx),
        Operation::Delete => validate_delete(ctx),
        Operation::Update => validate_update(ctx),
        Operation::Connect => ValidationResult::allowed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::StampContext;
    use kube::core::TypeMeta;

    fn managed_object() -> DynamicObject {
        let mut obj = DynamicObject {
            types: Some(TypeMeta {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
            }),
            metadata: Default::default(),
            data: serde_json::json!({"spec": {"replicas": 2}}),
        };
        obj.metadata.name = Some("web".into());
        obj.metadata.namespace = Some("shop".into());
        let ctx = StampContext {
            scope: Scope::Root,
            sync_name: "root-sync".into(),
            sync_kind: "RootSync",
            source_url: "https://example.com/config".into(),
        };
        metadata::stamp(&mut obj, &ctx, "deploy.yaml", "abc123");
        obj
    }

    const USER: &str = "kubernetes-admin";
    const ROOT_SA: &str = "system:serviceaccount:sync-operator-system:root-reconciler";

    fn update_ctx<'a>(
        username: &'a str,
        old: &'a DynamicObject,
        new: &'a DynamicObject,
    ) -> AdmissionContext<'a> {
        AdmissionContext {
            operation: Operation::Update,
            username,
            old_object: Some(old),
            new_object: Some(new),
        }
    }

    #[test]
    fn user_cannot_create_managed_object() {
        let obj = managed_object();
        let ctx = AdmissionContext {
            operation: Operation::Create,
            username: USER,
            old_object: None,
            new_object: Some(&obj),
        };
        let result = validate(&ctx);
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(DenyReason::Unauthorized));
    }

    #[test]
    fn user_cannot_delete_managed_object() {
        let obj = managed_object();
        let ctx = AdmissionContext {
            operation: Operation::Delete,
            username: USER,
            old_object: Some(&obj),
            new_object: None,
        };
        assert!(!validate(&ctx).allowed);
    }

    #[test]
    fn in_progress_delete_is_allowed() {
        let mut obj = managed_object();
        obj.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                k8s_openapi::chrono::Utc::now(),
            ));
        let ctx = AdmissionContext {
            operation: Operation::Delete,
            username: USER,
            old_object: Some(&obj),
            new_object: None,
        };
        assert!(validate(&ctx).allowed);
    }

    #[test]
    fn user_cannot_update_declared_field() {
        let old = managed_object();
        let mut new = old.clone();
        new.data["spec"]["replicas"] = serde_json::json!(5);
        let result = validate(&update_ctx(USER, &old, &new));
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(DenyReason::Forbidden));
        assert!(result.message.unwrap().contains("spec.replicas"));
    }

    #[test]
    fn user_can_update_undeclared_field() {
        let old = managed_object();
        let mut new = old.clone();
        new.data["spec"]["paused"] = serde_json::json!(true);
        assert!(validate(&update_ctx(USER, &old, &new)).allowed);
    }

    #[test]
    fn user_cannot_strip_management_metadata() {
        let old = managed_object();
        let mut new = old.clone();
        new.metadata
            .labels
            .as_mut()
            .unwrap()
            .remove(metadata::MANAGED_LABEL);
        let result = validate(&update_ctx(USER, &old, &new));
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(DenyReason::Forbidden));
    }

    #[test]
    fn ignore_mutation_exempts_declared_fields_but_not_metadata() {
        let mut old = managed_object();
        metadata::set_annotation(
            &mut old,
            metadata::LIFECYCLE_MUTATION_ANNOTATION,
            metadata::IGNORE_MUTATION,
        );
        let mut new = old.clone();
        new.data["spec"]["replicas"] = serde_json::json!(7);
        assert!(validate(&update_ctx(USER, &old, &new)).allowed);

        let mut stripped = old.clone();
        stripped
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .remove(metadata::RESOURCE_MANAGER_ANNOTATION);
        assert!(!validate(&update_ctx(USER, &old, &stripped)).allowed);
    }

    #[test]
    fn owning_reconciler_may_update() {
        let old = managed_object();
        let mut new = old.clone();
        new.data["spec"]["replicas"] = serde_json::json!(5);
        assert!(validate(&update_ctx(ROOT_SA, &old, &new)).allowed);
    }

    #[test]
    fn foreign_reconciler_is_unauthorized() {
        let old = managed_object();
        let mut new = old.clone();
        new.data["spec"]["replicas"] = serde_json::json!(5);
        let foreign = "system:serviceaccount:sync-operator-system:ns-reconciler-tenant-a";
        let result = validate(&update_ctx(foreign, &old, &new));
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(DenyReason::Unauthorized));
        let message = result.message.unwrap();
        assert!(message.contains("ns-reconciler-tenant-a"));
        assert!(message.contains(":root:root-sync"));
    }

    #[test]
    fn notified_annotation_only_update_is_allowed_for_reconciler() {
        let old = managed_object();
        let mut new = old.clone();
        metadata::set_annotation(&mut new, metadata::NOTIFIED_ANNOTATION, "delivered");
        // The annotation is not in the declared snapshot, so the manager
        // check is bypassed via the bookkeeping exemption.
        let foreign = "system:serviceaccount:sync-operator-system:ns-reconciler-tenant-a";
        assert!(validate(&update_ctx(foreign, &old, &new)).allowed);
    }

    #[test]
    fn unmanaged_objects_pass_through() {
        let mut obj = managed_object();
        obj.metadata.labels = None;
        obj.metadata.annotations = None;
        let mut new = obj.clone();
        new.data["spec"]["replicas"] = serde_json::json!(9);
        assert!(validate(&update_ctx(USER, &obj, &new)).allowed);
    }

    #[test]
    fn reconciler_manager_mapping() {
        assert_eq!(
            reconciler_for_manager(":root:root-sync").as_deref(),
            Some("root-reconciler")
        );
        assert_eq!(
            reconciler_for_manager("tenant-a:repo-sync").as_deref(),
            Some("ns-reconciler-tenant-a")
        );
        assert_eq!(reconciler_for_manager("garbage"), None);
    }
}
