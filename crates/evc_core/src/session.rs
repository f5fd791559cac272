use chrono::Utc;

use crate::{ChargingSession, SessionStatus, StationId};

/// Cost of `kwh` at `price_per_kwh`, rounded to cents.
pub fn bill(kwh: f64, price_per_kwh: f64) -> f64 {
    (kwh * price_per_kwh * 100.0).round() / 100.0
}

impl ChargingSession {
    pub fn new(
        station_id: impl Into<StationId>,
        driver_id: impl Into<String>,
        kwh_requested: f64,
        price_per_kwh: f64,
    ) -> Self {
        ChargingSession {
            session_id: uuid::Uuid::new_v4(),
            station_id: station_id.into(),
            driver_id: driver_id.into(),
            kwh_requested,
            kwh_delivered: 0.0,
            price_per_kwh,
            status: SessionStatus::Pending,
            cost: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn activate(&mut self) -> bool {
        if self.status != SessionStatus::Pending {
            return false;
        }
        self.status = SessionStatus::Active;
        true
    }

    /// Applies a telemetry reading. Readings for a non-ACTIVE session and
    /// readings lower than what is already recorded are discarded.
    pub fn record_delivery(&mut self, kwh_delivered: f64) -> bool {
        if self.status != SessionStatus::Active
            || !kwh_delivered.is_finite()
            || kwh_delivered < self.kwh_delivered
        {
            return false;
        }
        self.kwh_delivered = kwh_delivered;
        true
    }

    pub fn target_reached(&self) -> bool {
        self.kwh_delivered >= self.kwh_requested
    }

    pub fn complete(&mut self, final_kwh: f64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if final_kwh.is_finite() && final_kwh > self.kwh_delivered {
            self.kwh_delivered = final_kwh;
        }
        self.finish(SessionStatus::Completed);
        true
    }

    /// Cancels the session, billing what was delivered up to now.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.finish(SessionStatus::Cancelled);
        true
    }

    pub fn fail(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.finish(SessionStatus::Failed);
        true
    }

    fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.cost = Some(bill(self.kwh_delivered, self.price_per_kwh));
        self.ended_at = Some(Utc::now());
    }
}
