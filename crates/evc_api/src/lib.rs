//! HTTP surfaces of the charging network.
//!
//! `registry_app` serves station onboarding; `central_app` serves the
//! operator and driver operations of the coordinator.

mod registry;
mod session;
mod station;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use evc_central::Coordinator;
use evc_core::CoreError;
use evc_core::registry::Registry;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

pub use registry::{RegisterRequest, VerifyResponse};
pub use session::{ChargeRequest, ChargeResponse};
pub use station::StationResponse;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
}

pub fn status_for(error: &CoreError) -> StatusCode {
    match error {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) | CoreError::FatalState { .. } => StatusCode::CONFLICT,
        CoreError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::TransientNetwork(_) => StatusCode::GATEWAY_TIMEOUT,
        CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: CoreError) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::warn!(error = %error, "request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// Router for the registry service
pub fn registry_app(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/register", post(registry::register))
        .route("/unregister/{station_id}", delete(registry::unregister))
        .route("/list", get(registry::list))
        .route("/verify", post(registry::verify))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Router for the coordinator's operator and driver endpoints
pub fn central_app(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stations", get(station::list_stations))
        .route("/stations/{station_id}/stop", post(station::stop_station))
        .route("/stations/{station_id}/resume", post(station::resume_station))
        .route("/stations/{station_id}/reset", post(station::reset_station))
        .route("/sessions", post(session::request_charge))
        .route("/sessions/history", get(session::history))
        .route("/sessions/{session_id}", get(session::get_session))
        .route("/sessions/{session_id}/finish", post(session::finish_session))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}
