//! Admission webhook server.
//!
//! Serves the validating webhook protecting managed objects from drift by
//! untrusted principals. The ValidatingWebhookConfiguration restricts
//! interception to objects carrying the management label; the policy in
//! `policies` decides each request.
//!
//! To enable the gate:
//! 1. Deploy cert-manager (or any PKI) for the serving certificate
//! 2. Create the ValidatingWebhookConfiguration pointing at `/validate`
//! 3. Mount the TLS secret at /etc/webhook/certs/
//!
//! The server starts automatically when certificates are present.

use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::post};
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{debug, error, info, warn};

use crate::webhooks::policies::{AdmissionContext, validate};

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 9443;

/// Serving path registered in the ValidatingWebhookConfiguration.
pub const SERVING_PATH: &str = "/validate";

/// Create the webhook router
pub fn create_webhook_router() -> Router {
    Router::new().route(SERVING_PATH, post(handle_admission))
}

/// Handle one AdmissionReview for any managed object kind.
async fn handle_admission(Json(review): Json<AdmissionReview<DynamicObject>>) -> impl IntoResponse {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to extract admission request");
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid AdmissionReview: {e}"))
                        .into_review(),
                ),
            );
        }
    };

    let uid = request.uid.clone();
    let username = request.user_info.username.clone().unwrap_or_default();
    debug!(
        uid = %uid,
        operation = ?request.operation,
        username = %username,
        namespace = ?request.namespace,
        name = ?request.name,
        "Processing admission request"
    );

    // Sub-resource requests don't carry the full parent object; the webhook
    // configuration excludes them, so this is a safety valve.
    if !request.sub_resource.clone().unwrap_or_default().is_empty() {
        warn!(uid = %uid, "Allowing sub-resource admission request");
        return (
            StatusCode::OK,
            Json(AdmissionResponse::from(&request).into_review()),
        );
    }

    let ctx = AdmissionContext {
        operation: request.operation.clone(),
        username: &username,
        old_object: request.old_object.as_ref(),
        new_object: request.object.as_ref(),
    };
    let result = validate(&ctx);

    if result.allowed {
        debug!(uid = %uid, "Admission request allowed");
        return (
            StatusCode::OK,
            Json(AdmissionResponse::from(&request).into_review()),
        );
    }

    let reason = result
        .reason
        .map(|r| r.as_str())
        .unwrap_or("Forbidden");
    let message = result
        .message
        .unwrap_or_else(|| "Validation failed".to_string());
    info!(uid = %uid, reason = %reason, message = %message, "Admission request denied");
    let review = AdmissionResponse::from(&request)
        .deny(format!("[{reason}] {message}"))
        .into_review();
    (StatusCode::OK, Json(review))
}

/// Errors that can occur when running the webhook server
#[derive(Debug)]
pub enum WebhookError {
    /// TLS configuration error
    TlsConfig(String),
    /// Server error
    Server(String),
}

impl std::fmt::Display for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookError::TlsConfig(msg) => write!(f, "TLS configuration error: {msg}"),
            WebhookError::Server(msg) => write!(f, "Webhook server error: {msg}"),
        }
    }
}

impl std::error::Error for WebhookError {}

/// Run the webhook server with TLS.
///
/// Binds to 0.0.0.0:9443 and serves `/validate`. TLS certificates are
/// loaded from the paths specified.
pub async fn run_webhook_server(cert_path: &str, key_path: &str) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    let app = create_webhook_router();

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!(port = WEBHOOK_PORT, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}
