//! Admission webhook server.
//!
//! Serves both mutating webhooks over HTTPS. The certificate and key are
//! mounted into the pod, typically from a cert-manager issued secret.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use thiserror::Error;
use tracing::{debug, error, info};

use super::image_replication::ImageReplicationWebhook;
use super::pod_settings;
use crate::health::HealthState;
use crate::index::{NamespaceIndex, PodSettingIndex};

pub const POD_SETTINGS_PATH: &str = "/mutate-pod-settings";
pub const IMAGE_REPLICATION_PATH: &str = "/mutate-image-replication";

/// Shared state for webhook handlers
pub struct WebhookState {
    pub namespaces: NamespaceIndex,
    pub pod_settings: PodSettingIndex,
    pub images: ImageReplicationWebhook,
    pub health_state: Option<Arc<HealthState>>,
}

impl WebhookState {
    fn record(&self, webhook: &str, outcome: &str) {
        if let Some(ref health) = self.health_state {
            health.metrics.record_admission(webhook, outcome);
        }
    }
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(POD_SETTINGS_PATH, post(mutate_pod_settings))
        .route(IMAGE_REPLICATION_PATH, post(mutate_image_replication))
        .with_state(state)
}

type ReviewResponse = (StatusCode, Json<AdmissionReview<DynamicObject>>);

fn parse(
    state: &WebhookState,
    webhook: &str,
    review: AdmissionReview<Pod>,
) -> Result<AdmissionRequest<Pod>, ReviewResponse> {
    match review.try_into() {
        Ok(request) => Ok(request),
        Err(e) => {
            error!(webhook = %webhook, error = %e, "Failed to extract admission request");
            state.record(webhook, "invalid");
            Err((
                StatusCode::BAD_REQUEST,
                Json(AdmissionResponse::invalid(format!("Invalid AdmissionReview: {e}")).into_review()),
            ))
        }
    }
}

fn respond(state: &WebhookState, webhook: &str, response: AdmissionResponse) -> ReviewResponse {
    let outcome = if response.patch.is_some() { "patched" } else { "allowed" };
    state.record(webhook, outcome);
    (StatusCode::OK, Json(response.into_review()))
}

async fn mutate_pod_settings(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> impl IntoResponse {
    let request = match parse(&state, "pod-settings", review) {
        Ok(request) => request,
        Err(response) => return response,
    };
    debug!(
        uid = %request.uid,
        operation = ?request.operation,
        namespace = ?request.namespace,
        "Processing pod-settings admission request"
    );
    let response = pod_settings::mutate(&request, &state.namespaces, &state.pod_settings);
    respond(&state, "pod-settings", response)
}

async fn mutate_image_replication(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> impl IntoResponse {
    let request = match parse(&state, "image-replication", review) {
        Ok(request) => request,
        Err(response) => return response,
    };
    debug!(
        uid = %request.uid,
        operation = ?request.operation,
        namespace = ?request.namespace,
        "Processing image-replication admission request"
    );
    let response = state.images.mutate(&request).await;
    respond(&state, "image-replication", response)
}

/// Errors that can occur when running the webhook server
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("Webhook server error: {0}")]
    Server(String),
}

/// Run the webhook server with TLS on 0.0.0.0:`port`.
pub async fn run_webhook_server(
    state: Arc<WebhookState>,
    port: u16,
    cert_path: &str,
    key_path: &str,
) -> Result<(), WebhookError> {
    let app = create_webhook_router(state.clone());

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(port = port, "Webhook server listening with TLS");
    if let Some(ref health) = state.health_state {
        health.set_ready(true).await;
    }

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}
