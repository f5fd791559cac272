use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CoreError;

pub type StationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Location { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.lat.abs() <= 90.0
            && self.lon.abs() <= 180.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.lat, self.lon)
    }
}

/// Operational state of a charging point in the coordinator's fleet view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StationStatus {
    Registered,
    Activated,
    Charging,
    Stopped,
    Disconnected,
    Error,
}

impl StationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StationStatus::Registered => "REGISTERED",
            StationStatus::Activated => "ACTIVATED",
            StationStatus::Charging => "CHARGING",
            StationStatus::Stopped => "STOPPED",
            StationStatus::Disconnected => "DISCONNECTED",
            StationStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingPoint {
    pub id: StationId,
    pub location: Location,
    pub price_per_kwh: f64,
    pub status: StationStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl ChargingPoint {
    /// A freshly admitted point starts REGISTERED until it proves liveness.
    pub fn new(id: impl Into<StationId>, location: Location, price_per_kwh: f64) -> Self {
        ChargingPoint {
            id: id.into(),
            location,
            price_per_kwh,
            status: StationStatus::Registered,
            last_heartbeat: None,
            registered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Failed
        )
    }

    /// PENDING and ACTIVE sessions still hold their station.
    pub fn is_unresolved(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSession {
    pub session_id: uuid::Uuid,
    pub station_id: StationId,
    pub driver_id: String,
    pub kwh_requested: f64,
    pub kwh_delivered: f64,
    /// Price of the station when the session was admitted.
    pub price_per_kwh: f64,
    pub status: SessionStatus,
    pub cost: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Checks the onboarding data shared by the registry and the coordinator.
pub fn validate_station(
    station_id: &str,
    location: &Location,
    price_per_kwh: f64,
) -> Result<(), CoreError> {
    if station_id.trim().is_empty() {
        return Err(CoreError::Validation("station id must not be empty".into()));
    }
    if !location.is_valid() {
        return Err(CoreError::Validation(format!(
            "location {location} is out of range"
        )));
    }
    if !price_per_kwh.is_finite() || price_per_kwh < 0.0 {
        return Err(CoreError::Validation(format!(
            "price per kWh {price_per_kwh} must be a non-negative number"
        )));
    }
    Ok(())
}
