//! Admission gate behavior over the wire shape the API server sends.

use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionReview};
use sync_operator::webhooks::{AdmissionContext, DenyReason, Operation, validate};

use crate::common::fixtures::managed_object;

/// Build an AdmissionReview JSON body the way the API server would.
fn review_json(operation: &str, old: Option<&DynamicObject>, new: Option<&DynamicObject>) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "apps", "version": "v1", "kind": "Deployment"},
            "resource": {"group": "apps", "version": "v1", "resource": "deployments"},
            "name": "web",
            "namespace": "shop",
            "operation": operation,
            "userInfo": {"username": "kubernetes-admin"},
            "object": new,
            "oldObject": old,
            "dryRun": false
        }
    })
}

#[test]
fn admission_review_round_trips_dynamic_objects() {
    let old = managed_object("apps/v1", "Deployment", Some("shop"), "web");
    let mut new = old.clone();
    new.data["spec"]["replicas"] = serde_json::json!(9);

    let review: AdmissionReview<DynamicObject> =
        serde_json::from_value(review_json("UPDATE", Some(&old), Some(&new))).expect("parses");
    let request: AdmissionRequest<DynamicObject> = review.try_into().expect("valid request");
    assert_eq!(request.operation, Operation::Update);

    let username = request.user_info.username.clone().unwrap_or_default();
    let ctx = AdmissionContext {
        operation: request.operation.clone(),
        username: &username,
        old_object: request.old_object.as_ref(),
        new_object: request.object.as_ref(),
    };
    let result = validate(&ctx);
    assert!(!result.allowed);
    assert_eq!(result.reason, Some(DenyReason::Forbidden));
    let message = result.message.expect("denial names the disputed fields");
    assert!(message.contains("spec.replicas"));
    assert!(message.contains("kubernetes-admin"));
}

#[test]
fn create_of_unmanaged_object_is_allowed() {
    let new = crate::common::fixtures::unmanaged_object("apps/v1", "Deployment", Some("shop"), "web");
    let review: AdmissionReview<DynamicObject> =
        serde_json::from_value(review_json("CREATE", None, Some(&new))).expect("parses");
    let request: AdmissionRequest<DynamicObject> = review.try_into().expect("valid request");

    let username = request.user_info.username.clone().unwrap_or_default();
    let ctx = AdmissionContext {
        operation: request.operation.clone(),
        username: &username,
        old_object: request.old_object.as_ref(),
        new_object: request.object.as_ref(),
    };
    assert!(validate(&ctx).allowed);
}
