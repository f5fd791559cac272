use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use evc_core::Location;
use evc_core::registry::{Credentials, Registry, RegistryEntry};
use serde::{Deserialize, Serialize};

use crate::{ErrorResponse, error_response};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub station_id: String,
    pub lat: f64,
    pub lon: f64,
    pub price_per_kwh: f64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub valid: bool,
}

/// Onboard a station and issue its credentials
pub async fn register(
    State(registry): State<Arc<Registry>>,
    Json(payload): Json<RegisterRequest>,
) -> impl IntoResponse {
    let location = Location::new(payload.lat, payload.lon);
    match registry.register(&payload.station_id, location, payload.price_per_kwh) {
        Ok(credentials) => (StatusCode::CREATED, Json(credentials)).into_response(),
        Err(error) => error_response(error),
    }
}

pub async fn unregister(
    State(registry): State<Arc<Registry>>,
    Path(station_id): Path<String>,
) -> impl IntoResponse {
    match registry.unregister(&station_id) {
        Ok(entry) => (StatusCode::OK, Json(entry)).into_response(),
        Err(error) => error_response(error),
    }
}

pub async fn list(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    match registry.list() {
        Ok(entries) => Json::<Vec<RegistryEntry>>(entries).into_response(),
        Err(error) => error_response(error),
    }
}

/// Check a station's credentials: 200 when valid, 401 otherwise
pub async fn verify(
    State(registry): State<Arc<Registry>>,
    Json(credentials): Json<Credentials>,
) -> impl IntoResponse {
    match registry.verify(&credentials.station_id, &credentials.username, &credentials.password) {
        Ok(true) => (StatusCode::OK, Json(VerifyResponse { valid: true })).into_response(),
        Ok(false) => {
            tracing::warn!(station_id = %credentials.station_id, "credential check failed");
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "invalid credentials".into(),
                }),
            )
                .into_response()
        }
        Err(error) => error_response(error),
    }
}
