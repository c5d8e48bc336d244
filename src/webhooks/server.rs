//! Admission webhook server.
//!
//! Serves the mutating and validating admission endpoints for CrdbCluster
//! over TLS on port 9443. The serving certificate is provisioned by the
//! bootstrap module, which also patches the CA bundle into the webhook
//! configurations.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use kube::Client;
use kube::Resource;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::crd::CrdbCluster;
use crate::webhooks::policies::{ValidationContext, defaulting, validate_all};

/// Directory the bootstrap writes the serving certificate into.
pub const WEBHOOK_CERT_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";
/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/tmp/k8s-webhook-server/serving-certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/tmp/k8s-webhook-server/serving-certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 9443;

/// Shared state for webhook handlers
pub struct WebhookState {
    #[allow(dead_code)]
    pub client: Client,
}

impl WebhookState {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Create a denial response with reason embedded in message.
/// kube-rs deny() only sets status.message, so we format as "[reason] message"
fn deny_with_reason<T: Resource>(
    request: &AdmissionRequest<T>,
    message: &str,
    reason: &str,
) -> AdmissionReview<DynamicObject> {
    let full_message = format!("[{}] {}", reason, message);
    AdmissionResponse::from(request)
        .deny(full_message)
        .into_review()
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate-crdb-cluster", post(mutate_crdb_cluster))
        .route("/validate-crdb-cluster", post(validate_crdb_cluster))
        .with_state(state)
}

/// Mutating admission handler: materialize defaults as a JSON patch.
async fn mutate_crdb_cluster(
    State(_state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to extract admission request");
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("invalid AdmissionReview: {}", e))
                        .into_review(),
                ),
            );
        }
    };

    if request.operation == Operation::Delete {
        return (
            StatusCode::OK,
            Json(AdmissionResponse::from(&request).into_review()),
        );
    }

    let Some(raw) = request.object.as_ref() else {
        return (
            StatusCode::OK,
            Json(deny_with_reason(
                &request,
                "missing object in request",
                "InvalidRequest",
            )),
        );
    };

    let raw_value = match serde_json::to_value(raw) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::OK,
                Json(deny_with_reason(&request, &e.to_string(), "InvalidObject")),
            );
        }
    };
    // Deserializing applies the schema defaults; apply_defaults adds the
    // cross-field ones.
    let mut cluster: CrdbCluster = match serde_json::from_value(raw_value.clone()) {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::OK,
                Json(deny_with_reason(&request, &e.to_string(), "InvalidObject")),
            );
        }
    };
    defaulting::apply_defaults(&mut cluster);

    let defaulted = match serde_json::to_value(&cluster) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::OK,
                Json(deny_with_reason(&request, &e.to_string(), "InvalidObject")),
            );
        }
    };
    let patch = json_patch::diff(&raw_value, &defaulted);

    debug!(uid = %request.uid, patches = patch.0.len(), "defaulting patch computed");
    match AdmissionResponse::from(&request).with_patch(patch) {
        Ok(response) => (StatusCode::OK, Json(response.into_review())),
        Err(e) => (
            StatusCode::OK,
            Json(deny_with_reason(&request, &e.to_string(), "PatchFailed")),
        ),
    }
}

/// Validating admission handler.
async fn validate_crdb_cluster(
    State(_state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<CrdbCluster>>,
) -> impl IntoResponse {
    let request: AdmissionRequest<CrdbCluster> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to extract admission request");
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("invalid AdmissionReview: {}", e))
                        .into_review(),
                ),
            );
        }
    };

    let uid = &request.uid;
    debug!(
        uid = %uid,
        operation = ?request.operation,
        namespace = ?request.namespace,
        name = ?request.name,
        "processing admission request"
    );

    // DELETE operations are always allowed
    if request.operation == Operation::Delete {
        info!(uid = %uid, "admission request allowed (DELETE)");
        return (
            StatusCode::OK,
            Json(AdmissionResponse::from(&request).into_review()),
        );
    }

    let cluster: CrdbCluster = match &request.object {
        Some(obj) => obj.clone(),
        None => {
            error!(uid = %uid, "missing object in request");
            return (
                StatusCode::OK,
                Json(deny_with_reason(
                    &request,
                    "missing object in request",
                    "InvalidRequest",
                )),
            );
        }
    };
    let old_cluster: Option<CrdbCluster> = request.old_object.clone();

    let ctx = ValidationContext {
        cluster: &cluster,
        old_cluster: old_cluster.as_ref(),
        dry_run: request.dry_run,
        namespace: request.namespace.as_deref(),
    };
    let result = validate_all(&ctx);

    if !result.allowed {
        let reason = result
            .reason
            .unwrap_or_else(|| "ValidationFailed".to_string());
        let message = result
            .message
            .unwrap_or_else(|| "validation failed".to_string());
        warn!(uid = %uid, reason = %reason, message = %message, "admission request denied");
        return (
            StatusCode::OK,
            Json(deny_with_reason(&request, &message, &reason)),
        );
    }

    info!(uid = %uid, "admission request allowed");
    (
        StatusCode::OK,
        Json(AdmissionResponse::from(&request).into_review()),
    )
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
            WebhookError::TlsConfig(msg) => write!(f, "TLS configuration error: {}", msg),
            WebhookError::Server(msg) => write!(f, "Webhook server error: {}", msg),
        }
    }
}

impl std::error::Error for WebhookError {}

/// Run the webhook server with TLS on 0.0.0.0:9443.
pub async fn run_webhook_server(
    client: Client,
    cert_path: &str,
    key_path: &str,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    let state = Arc::new(WebhookState::new(client));
    let app = create_webhook_router(state);

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!(port = WEBHOOK_PORT, "webhook server listening with TLS");

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}
