//! Admission webhook server.
//!
//! Provides HTTP endpoints for Kubernetes admission webhooks.
//!
//! To enable webhooks:
//! 1. Deploy cert-manager for TLS certificates
//! 2. Create a ValidatingWebhookConfiguration for `clusters.cassandra.rook.io`
//! 3. Mount the TLS certificate secret to the operator pod at /etc/webhook/certs/
//!
//! The webhook server starts automatically when certificates are present.

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use kube::Client;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, error, info, warn};

use crate::crd::Cluster;
use crate::webhooks::policies::{ValidationContext, reasons, validate_all};

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 9443;
/// Path of the Cluster validation endpoint
pub const VALIDATE_CLUSTER_PATH: &str = "/validate-cluster";

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

fn deny(
    request: &AdmissionRequest<DynamicObject>,
    reason: &str,
    message: &str,
) -> AdmissionReview<DynamicObject> {
    warn!(uid = %request.uid, reason = %reason, message = %message, "Admission request denied");
    AdmissionResponse::from(request)
        .deny(message.to_string())
        .into_review()
}

fn decode_cluster(object: &DynamicObject) -> Result<Cluster, serde_json::Error> {
    serde_json::to_value(object).and_then(serde_json::from_value)
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(VALIDATE_CLUSTER_PATH, post(validate_cluster))
        .with_state(state)
}

/// Validate a decoded admission request against the Cluster policies.
pub fn review_request(request: &AdmissionRequest<DynamicObject>) -> AdmissionReview<DynamicObject> {
    debug!(
        uid = %request.uid,
        operation = ?request.operation,
        namespace = ?request.namespace,
        name = %request.name,
        "Processing admission request"
    );

    if !matches!(request.operation, Operation::Create | Operation::Update) {
        return AdmissionResponse::from(request).into_review();
    }

    let resource = match request.object.as_ref().map(decode_cluster) {
        Some(Ok(cluster)) => cluster,
        Some(Err(e)) => return deny(request, reasons::BAD_REQUEST, &e.to_string()),
        None => return deny(request, reasons::BAD_REQUEST, "missing object in request"),
    };

    let old_resource = match (&request.operation, request.old_object.as_ref()) {
        (Operation::Update, Some(old)) => match decode_cluster(old) {
            Ok(cluster) => Some(cluster),
            Err(e) => return deny(request, reasons::BAD_REQUEST, &e.to_string()),
        },
        (Operation::Update, None) => {
            return deny(request, reasons::BAD_REQUEST, "missing old object in update request");
        }
        _ => None,
    };

    let ctx = ValidationContext {
        resource: &resource,
        old_resource: old_resource.as_ref(),
    };
    let result = validate_all(&ctx);

    if !result.allowed {
        let reason = result.reason.as_deref().unwrap_or("ValidationFailed");
        let message = result.message.as_deref().unwrap_or("validation failed");
        return deny(request, reason, message);
    }

    info!(uid = %request.uid, "Admission request allowed");
    AdmissionResponse::from(request).into_review()
}

/// Cluster admission webhook handler
async fn validate_cluster(
    State(_state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to extract admission request");
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid AdmissionReview: {}", e))
                        .into_review(),
                ),
            );
        }
    };

    (StatusCode::OK, Json(review_request(&request)))
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

/// Run the webhook server with TLS
///
/// Binds to 0.0.0.0:9443 and serves the /validate-cluster endpoint.
/// TLS certificates are loaded from the paths specified.
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
    info!(port = WEBHOOK_PORT, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}
