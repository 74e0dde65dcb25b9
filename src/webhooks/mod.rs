//! The admission gate: a validating webhook that arbitrates mutations to
//! managed objects, preventing drift from untrusted principals between
//! apply passes.

pub mod policies;
mod server;

pub use policies::{AdmissionContext, DenyReason, ValidationResult, validate};
pub use server::{
    SERVING_PATH, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError,
    create_webhook_router, run_webhook_server,
};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
