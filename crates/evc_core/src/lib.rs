mod models;
pub mod bus;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod station;
pub mod store;

pub use crate::models::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy shared by every component of the network.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("station {station_id} is unavailable: {reason}")]
    Unavailable { station_id: StationId, reason: String },
    #[error("network error: {0}")]
    TransientNetwork(String),
    #[error("station {station_id} cannot {action} while {from}")]
    FatalState {
        station_id: StationId,
        from: StationStatus,
        action: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn station_not_found(station_id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "station",
            id: station_id.into(),
        }
    }

    pub fn session_not_found(session_id: uuid::Uuid) -> Self {
        CoreError::NotFound {
            kind: "session",
            id: session_id.to_string(),
        }
    }

    pub fn unavailable(station_id: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Unavailable {
            station_id: station_id.into(),
            reason: reason.into(),
        }
    }

    /// The result code a driver sees instead of the raw error.
    pub fn driver_result(&self) -> DriverResult {
        match self {
            CoreError::Validation(_) => DriverResult::Rejected,
            CoreError::NotFound { .. } => DriverResult::NotFound,
            CoreError::Conflict(_) => DriverResult::Busy,
            CoreError::Unavailable { .. }
            | CoreError::TransientNetwork(_)
            | CoreError::FatalState { .. }
            | CoreError::Storage(_) => DriverResult::Offline,
        }
    }
}

impl From<store::StoreError> for CoreError {
    fn from(error: store::StoreError) -> Self {
        CoreError::Storage(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverResult {
    Success,
    Busy,
    Offline,
    NotFound,
    Rejected,
}
