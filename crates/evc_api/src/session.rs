use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use evc_central::Coordinator;
use evc_core::{ChargingSession, DriverResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error_response, status_for};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeRequest {
    pub driver_id: String,
    pub station_id: String,
    pub kwh_requested: f64,
}

/// What a driver sees for a charge request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeResponse {
    pub result: DriverResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request a charge on a station
pub async fn request_charge(
    State(coordinator): State<Arc<Coordinator>>,
    Json(payload): Json<ChargeRequest>,
) -> impl IntoResponse {
    match coordinator
        .request_charge(&payload.driver_id, &payload.station_id, payload.kwh_requested)
        .await
    {
        Ok(session_id) => (
            StatusCode::CREATED,
            Json(ChargeResponse {
                result: DriverResult::Success,
                session_id: Some(session_id),
                error: None,
            }),
        )
            .into_response(),
        Err(error) => {
            tracing::info!(
                driver_id = %payload.driver_id,
                station_id = %payload.station_id,
                error = %error,
                "charge request refused"
            );
            (
                status_for(&error),
                Json(ChargeResponse {
                    result: error.driver_result(),
                    session_id: None,
                    error: Some(error.to_string()),
                }),
            )
                .into_response()
        }
    }
}

pub async fn get_session(
    State(coordinator): State<Arc<Coordinator>>,
    Path(session_id): Path<Uuid>,
) -> impl IntoResponse {
    match coordinator.session(session_id).await {
        Ok(session) => Json(session).into_response(),
        Err(error) => error_response(error),
    }
}

/// Driver unplug
pub async fn finish_session(
    State(coordinator): State<Arc<Coordinator>>,
    Path(session_id): Path<Uuid>,
) -> impl IntoResponse {
    match coordinator.end_charge(session_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(error) => error_response(error),
    }
}

/// Finished sessions, most recent first
pub async fn history(State(coordinator): State<Arc<Coordinator>>) -> Json<Vec<ChargingSession>> {
    Json(coordinator.history().await)
}
