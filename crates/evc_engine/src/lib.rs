//! Station-side processes: the charging engine simulation and its watchdog.

pub mod monitor;
pub mod net;
pub mod runtime;

use evc_core::bus::EventPayload;
use evc_core::station::{StationEvent, transition};
use evc_core::{CoreError, StationId, StationStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use runtime::{EngineConfig, EngineHandle};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] CoreError),
    #[error("station is already charging session {session_id}")]
    Busy { session_id: Uuid },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("engine is not running")]
    Closed,
}

/// The charge currently being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCharge {
    pub session_id: Uuid,
    pub kwh_requested: f64,
    pub kwh_delivered: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub station_id: StationId,
    pub status: StationStatus,
    pub charge: Option<ActiveCharge>,
    pub outage: bool,
}

/// Authoritative simulation of one charging point.
///
/// The engine only knows ACTIVATED, CHARGING, STOPPED and ERROR; liveness
/// states belong to the coordinator.
pub struct StationEngine {
    station_id: StationId,
    status: StationStatus,
    charge: Option<ActiveCharge>,
    outage: bool,
    kwh_per_tick: f64,
}

impl StationEngine {
    pub fn new(station_id: impl Into<StationId>, kwh_per_tick: f64) -> Self {
        StationEngine {
            station_id: station_id.into(),
            status: StationStatus::Activated,
            charge: None,
            outage: false,
            kwh_per_tick,
        }
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn status(&self) -> StationStatus {
        self.status
    }

    pub fn charge(&self) -> Option<ActiveCharge> {
        self.charge
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            station_id: self.station_id.clone(),
            status: self.status,
            charge: self.charge,
            outage: self.outage,
        }
    }

    /// Starts delivering `kwh_requested`. A repeated start of the session
    /// already charging succeeds without side effects.
    pub fn start(&mut self, session_id: Uuid, kwh_requested: f64) -> Result<(), EngineError> {
        if let Some(charge) = &self.charge {
            if charge.session_id == session_id {
                return Ok(());
            }
            return Err(EngineError::Busy {
                session_id: charge.session_id,
            });
        }
        if !kwh_requested.is_finite() || kwh_requested <= 0.0 {
            return Err(EngineError::InvalidRequest(format!(
                "cannot deliver {kwh_requested} kWh"
            )));
        }

        self.status = transition(&self.station_id, self.status, StationEvent::BeginCharging)?;
        self.charge = Some(ActiveCharge {
            session_id,
            kwh_requested,
            kwh_delivered: 0.0,
        });
        tracing::info!(station_id = %self.station_id, %session_id, kwh_requested, "charging started");
        Ok(())
    }

    /// Advances delivery by one step. Emits the new reading and, when the
    /// target is reached, the completion report.
    pub fn tick(&mut self) -> Vec<EventPayload> {
        if self.outage {
            return Vec::new();
        }
        let Some(charge) = self.charge.as_mut() else {
            return Vec::new();
        };

        charge.kwh_delivered = (charge.kwh_delivered + self.kwh_per_tick).min(charge.kwh_requested);
        let mut reports = vec![EventPayload::Telemetry {
            session_id: charge.session_id,
            kwh_delivered: charge.kwh_delivered,
        }];

        if charge.kwh_delivered >= charge.kwh_requested
            && let Some(finished) = self.complete()
        {
            reports.push(finished);
        }
        reports
    }

    /// Driver unplug. Finishing a session that is not charging here is a
    /// no-op, so late or repeated requests are harmless.
    pub fn finish(&mut self, session_id: Uuid) -> Option<EventPayload> {
        match self.charge {
            Some(charge) if charge.session_id == session_id => self.complete(),
            _ => {
                tracing::debug!(station_id = %self.station_id, %session_id, "finish for unknown session ignored");
                None
            }
        }
    }

    fn complete(&mut self) -> Option<EventPayload> {
        let charge = self.charge.take()?;
        self.status = StationStatus::Activated;
        tracing::info!(
            station_id = %self.station_id,
            session_id = %charge.session_id,
            final_kwh = charge.kwh_delivered,
            "charging finished"
        );
        Some(EventPayload::SessionFinished {
            session_id: charge.session_id,
            final_kwh: charge.kwh_delivered,
        })
    }

    /// Admin stop: halts delivery and reports the last reading.
    pub fn stop(&mut self) -> Result<Option<EventPayload>, EngineError> {
        if self.status == StationStatus::Stopped {
            return Ok(None);
        }
        self.status = transition(&self.station_id, self.status, StationEvent::Stop)?;
        tracing::info!(station_id = %self.station_id, "station stopped");

        Ok(self.charge.take().map(|charge| EventPayload::Telemetry {
            session_id: charge.session_id,
            kwh_delivered: charge.kwh_delivered,
        }))
    }

    /// Leaves STOPPED or ERROR. Resuming an ACTIVATED engine is a no-op.
    pub fn resume(&mut self) -> Result<(), EngineError> {
        let event = match self.status {
            StationStatus::Activated => return Ok(()),
            StationStatus::Error => StationEvent::Reset,
            _ => StationEvent::Resume,
        };
        self.status = transition(&self.station_id, self.status, event)?;
        tracing::info!(station_id = %self.station_id, "station resumed");
        Ok(())
    }

    /// Unrecoverable fault: delivery halts and the engine stays in ERROR.
    pub fn fault(&mut self, reason: impl Into<String>) -> EventPayload {
        let reason = reason.into();
        self.charge = None;
        self.status = StationStatus::Error;
        tracing::error!(station_id = %self.station_id, reason = %reason, "station fault");
        EventPayload::Fault { reason }
    }

    /// The coordinator went away; any charge in progress is abandoned.
    pub fn disconnect(&mut self) {
        if let Some(charge) = self.charge.take() {
            tracing::warn!(
                station_id = %self.station_id,
                session_id = %charge.session_id,
                "charge abandoned, coordinator disconnected"
            );
            self.status = StationStatus::Activated;
        }
    }

    /// Simulated outage: probes fail and delivery pauses.
    pub fn set_outage(&mut self, outage: bool) {
        if self.outage != outage {
            tracing::warn!(station_id = %self.station_id, outage, "outage simulation toggled");
        }
        self.outage = outage;
    }

    pub fn probe(&self) -> bool {
        !self.outage
    }
}
