//! Mutating admission webhook server.
//!
//! Serves the single dragnet endpoint all intercepted resources flow
//! through. The handler converts the admission request into an engine
//! request, runs the rule pipeline and maps the decision back onto an
//! `AdmissionResponse`.
//!
//! To enable the webhook:
//! 1. Deploy cert-manager (or otherwise provision TLS certificates)
//! 2. Create a MutatingWebhookConfiguration pointing at `/mutate`
//! 3. Mount the TLS certificate secret at /etc/webhook/certs/

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::crd::ModRuleOperation;
use crate::engine::{AdmissionDecision, AdmissionEngine};

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 9443;

/// Shared state for webhook handlers
pub struct WebhookState {
    pub engine: Arc<AdmissionEngine>,
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new().route("/mutate", post(mutate)).with_state(state)
}

/// The mutating admission handler all intercepted resources pass through.
async fn mutate(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
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

    let uid = request.uid.clone();
    debug!(
        uid = %uid,
        operation = ?request.operation,
        namespace = ?request.namespace,
        name = %request.name,
        kind = %request.kind.kind,
        "Processing admission request"
    );

    let Some(operation) = map_operation(&request.operation) else {
        // CONNECT never carries rules.
        return (
            StatusCode::OK,
            Json(AdmissionResponse::from(&request).into_review()),
        );
    };

    let namespace = effective_namespace(&request);

    // Deletion requests carry no new object; rules run against the object
    // being deleted.
    let target = if operation == ModRuleOperation::Delete {
        request.old_object.as_ref()
    } else {
        request.object.as_ref()
    };
    let Some(target) = target else {
        warn!(uid = %uid, "admission request carries no object");
        return (
            StatusCode::OK,
            Json(AdmissionResponse::from(&request).into_review()),
        );
    };

    // A payload that cannot be decoded must not fail the admission; it
    // resolves to an allow carrying the standard reason.
    let decision = match serde_json::to_value(target) {
        Ok(document) => state.engine.evaluate(operation, &namespace, document).await,
        Err(e) => {
            warn!(uid = %uid, error = %e, "failed to decode admission object");
            AdmissionDecision::Allowed {
                reason: Some("failed to calculate patch".to_string()),
            }
        }
    };

    let response = match decision {
        AdmissionDecision::Allowed { reason } => {
            if let Some(reason) = reason {
                info!(uid = %uid, %reason, "Admission request allowed");
            }
            AdmissionResponse::from(&request)
        }
        AdmissionDecision::Denied(message) => {
            info!(uid = %uid, %message, "Admission request denied");
            AdmissionResponse::from(&request).deny(format!(
                "operation rejected by the following ModRule(s): {}",
                message
            ))
        }
        AdmissionDecision::Patched(patch) => {
            info!(uid = %uid, operations = patch.0.len(), "Applying ModRule patch");
            match AdmissionResponse::from(&request).with_patch(patch) {
                Ok(response) => response,
                Err(e) => {
                    error!(uid = %uid, error = %e, "failed to attach patch to response");
                    AdmissionResponse::invalid(format!("failed to serialize patch: {}", e))
                }
            }
        }
    };

    (StatusCode::OK, Json(response.into_review()))
}

fn map_operation(operation: &Operation) -> Option<ModRuleOperation> {
    match operation {
        Operation::Create => Some(ModRuleOperation::Create),
        Operation::Update => Some(ModRuleOperation::Update),
        Operation::Delete => Some(ModRuleOperation::Delete),
        Operation::Connect => None,
    }
}

/// The namespace used for rule resolution. Namespaces themselves are
/// cluster-scoped objects even though UPDATE requests report them as their
/// own owner, so they resolve against the cluster bucket. Detection is by
/// request group/version/kind only, never by payload.
fn effective_namespace(request: &AdmissionRequest<DynamicObject>) -> String {
    if request.kind.group.is_empty()
        && request.kind.version == "v1"
        && request.kind.kind == "Namespace"
    {
        return String::new();
    }
    request.namespace.clone().unwrap_or_default()
}

/// Errors that can occur when running the webhook server
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    /// Server error
    #[error("Webhook server error: {0}")]
    Server(String),
}

/// Run the webhook server with TLS
///
/// Binds to 0.0.0.0:9443 and serves the /mutate endpoint. TLS certificates
/// are loaded from the paths specified.
pub async fn run_webhook_server(
    engine: Arc<AdmissionEngine>,
    cert_path: &str,
    key_path: &str,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    let state = Arc::new(WebhookState { engine });
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
