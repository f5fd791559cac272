//! Station state machine.
//!
//! `REGISTERED -> ACTIVATED <-> CHARGING`, admin `STOPPED`, liveness
//! `DISCONNECTED`, and the sticky `ERROR` state that only a manual reset
//! leaves. Every transition not listed in [`StationStatus::apply`] is rejected.

use crate::{CoreError, StationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationEvent {
    /// First proof of liveness for a registered point.
    Activate,
    BeginCharging,
    /// Session finished, or a start command was rolled back.
    EndCharging,
    Stop,
    Resume,
    Disconnect,
    Recover,
    Fault,
    Reset,
}

impl StationEvent {
    pub fn action(&self) -> &'static str {
        match self {
            StationEvent::Activate => "activate",
            StationEvent::BeginCharging => "begin charging",
            StationEvent::EndCharging => "end charging",
            StationEvent::Stop => "stop",
            StationEvent::Resume => "resume",
            StationEvent::Disconnect => "disconnect",
            StationEvent::Recover => "recover",
            StationEvent::Fault => "fault",
            StationEvent::Reset => "reset",
        }
    }
}

impl StationStatus {
    /// Returns the next state, or `None` when the event is not allowed here.
    pub fn apply(self, event: StationEvent) -> Option<StationStatus> {
        use StationEvent as E;
        use StationStatus as S;

        match (self, event) {
            (S::Registered, E::Activate) => Some(S::Activated),
            (S::Activated, E::BeginCharging) => Some(S::Charging),
            (S::Charging, E::EndCharging) => Some(S::Activated),
            (S::Activated | S::Charging, E::Stop) => Some(S::Stopped),
            (S::Stopped, E::Resume) => Some(S::Activated),
            (S::Registered | S::Activated | S::Charging, E::Disconnect) => Some(S::Disconnected),
            (S::Disconnected, E::Recover) => Some(S::Activated),
            (_, E::Fault) => Some(S::Error),
            (S::Error, E::Reset) => Some(S::Activated),
            _ => None,
        }
    }

    /// A charge request may only bind to an ACTIVATED point.
    pub fn accepts_sessions(&self) -> bool {
        *self == StationStatus::Activated
    }

    /// States in which a charge request is answered as "offline" rather than "busy".
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StationStatus::Stopped | StationStatus::Disconnected | StationStatus::Error
        )
    }
}

/// Applies `event` to `from`, producing a `FatalState` error for illegal moves.
pub fn transition(
    station_id: &str,
    from: StationStatus,
    event: StationEvent,
) -> Result<StationStatus, CoreError> {
    from.apply(event).ok_or_else(|| CoreError::FatalState {
        station_id: station_id.to_string(),
        from,
        action: event.action(),
    })
}
