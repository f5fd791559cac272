use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use evc_central::Coordinator;
use evc_core::{ChargingPoint, CoreError, StationStatus};
use serde::{Deserialize, Serialize};

use crate::error_response;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationResponse {
    pub station_id: String,
    pub status: StationStatus,
}

fn station_result(station_id: String, result: Result<StationStatus, CoreError>) -> axum::response::Response {
    match result {
        Ok(status) => Json(StationResponse { station_id, status }).into_response(),
        Err(error) => error_response(error),
    }
}

/// Fleet snapshot ordered by station id
pub async fn list_stations(State(coordinator): State<Arc<Coordinator>>) -> Json<Vec<ChargingPoint>> {
    Json(coordinator.list().await)
}

pub async fn stop_station(
    State(coordinator): State<Arc<Coordinator>>,
    Path(station_id): Path<String>,
) -> impl IntoResponse {
    tracing::info!(station_id = %station_id, "admin stop requested");
    let result = coordinator.admin_stop(&station_id).await;
    station_result(station_id, result)
}

pub async fn resume_station(
    State(coordinator): State<Arc<Coordinator>>,
    Path(station_id): Path<String>,
) -> impl IntoResponse {
    tracing::info!(station_id = %station_id, "admin resume requested");
    let result = coordinator.admin_resume(&station_id).await;
    station_result(station_id, result)
}

pub async fn reset_station(
    State(coordinator): State<Arc<Coordinator>>,
    Path(station_id): Path<String>,
) -> impl IntoResponse {
    tracing::info!(station_id = %station_id, "admin reset requested");
    let result = coordinator.admin_reset(&station_id).await;
    station_result(station_id, result)
}
