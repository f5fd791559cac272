//! Fleet-wide authority over charging points and sessions.
//!
//! Each station lives in its own cell behind a `tokio::sync::Mutex`; every
//! mutation of a station and its bound session happens under that lock, so
//! operations on one station apply in arrival order while different stations
//! proceed in parallel. Locks are taken directory first, then cell, then
//! history; the directory lock is only held to look up, insert or remove
//! cells, and no lock is ever held across a control-channel call.
//!
//! A removed station's cell is flagged before it leaves the directory, so a
//! caller that looked the cell up earlier sees `NotFound` once it gets the
//! lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evc_core::bus::{Delivery, Event, EventBus, EventPayload, EventPublisher, Origin, Publisher, SequenceTracker};
use evc_core::registry::RegistryEntry;
use evc_core::station::{StationEvent, transition};
use evc_core::store::{RecordStore, list_typed, put_typed};
use evc_core::{
    ChargingPoint, ChargingSession, CoreError, Location, SessionStatus, StationId, StationStatus,
    validate_station,
};
use evc_engine::monitor::{LivenessReporter, ReportError};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::control::{ControlChannel, ControlCommand, ControlError, RetryPolicy, send_with_retry};

const STATION_PREFIX: &str = "station/";
const SESSION_PREFIX: &str = "session/";

fn station_key(station_id: &str) -> String {
    format!("{STATION_PREFIX}{station_id}")
}

fn session_key(session_id: Uuid) -> String {
    format!("{SESSION_PREFIX}{session_id}")
}

/// A charging point and the session bound to it, if any. A bound session is
/// always PENDING or ACTIVE; terminal sessions move to the history.
struct StationCell {
    point: ChargingPoint,
    session: Option<ChargingSession>,
    removed: bool,
}

impl StationCell {
    fn new(point: ChargingPoint) -> Self {
        StationCell {
            point,
            session: None,
            removed: false,
        }
    }

    fn has_unresolved_session(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.status.is_unresolved())
    }
}

enum Outcome {
    Complete(f64),
    Cancel,
    Fail(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub admitted: Vec<StationId>,
    pub removed: Vec<StationId>,
    /// Stale stations kept until their unresolved session ends.
    pub deferred: Vec<StationId>,
}

pub struct Coordinator {
    stations: RwLock<HashMap<StationId, Arc<Mutex<StationCell>>>>,
    history: RwLock<Vec<ChargingSession>>,
    store: Arc<dyn RecordStore>,
    publisher: Publisher,
    control: Arc<dyn ControlChannel>,
    retry: RetryPolicy,
    accepting: AtomicBool,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        bus: Arc<dyn EventPublisher>,
        control: Arc<dyn ControlChannel>,
        retry: RetryPolicy,
    ) -> Self {
        Coordinator {
            stations: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            store,
            publisher: Publisher::new(bus, Origin::Coordinator),
            control,
            retry,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    async fn cell(&self, station_id: &str) -> Result<Arc<Mutex<StationCell>>, CoreError> {
        self.stations
            .read()
            .await
            .get(station_id)
            .cloned()
            .ok_or_else(|| CoreError::station_not_found(station_id))
    }

    /// Locks a live station's cell.
    async fn lock_cell(&self, station_id: &str) -> Result<OwnedMutexGuard<StationCell>, CoreError> {
        let guard = self.cell(station_id).await?.lock_owned().await;
        if guard.removed {
            return Err(CoreError::station_not_found(station_id));
        }
        Ok(guard)
    }

    async fn cells(&self) -> Vec<(StationId, Arc<Mutex<StationCell>>)> {
        self.stations
            .read()
            .await
            .iter()
            .map(|(id, cell)| (id.clone(), cell.clone()))
            .collect()
    }

    fn persist_point(&self, point: &ChargingPoint) {
        if let Err(error) = put_typed(self.store.as_ref(), &station_key(&point.id), point) {
            tracing::warn!(station_id = %point.id, error = %error, "failed to persist charging point");
        }
    }

    fn persist_session(&self, session: &ChargingSession) {
        if let Err(error) = put_typed(self.store.as_ref(), &session_key(session.session_id), session) {
            tracing::warn!(session_id = %session.session_id, error = %error, "failed to persist session");
        }
    }

    /// Applies a state-machine event to `point` and persists the result.
    fn apply(&self, point: &mut ChargingPoint, event: StationEvent) -> Result<StationStatus, CoreError> {
        let next = transition(&point.id, point.status, event).inspect_err(|error| {
            tracing::warn!(station_id = %point.id, error = %error, "transition rejected");
        })?;
        tracing::info!(station_id = %point.id, from = %point.status, to = %next, "station transition");
        point.status = next;
        self.persist_point(point);
        Ok(next)
    }

    /// Terminates the bound session and archives it.
    async fn resolve_bound(&self, cell: &mut StationCell, outcome: Outcome) -> Option<ChargingSession> {
        let mut session = cell.session.take()?;
        let payload = match outcome {
            Outcome::Complete(final_kwh) => {
                session.complete(final_kwh);
                EventPayload::SessionCompleted {
                    session_id: session.session_id,
                    kwh_delivered: session.kwh_delivered,
                    cost: session.cost.unwrap_or_default(),
                }
            }
            Outcome::Cancel => {
                session.cancel();
                EventPayload::SessionCancelled {
                    session_id: session.session_id,
                    kwh_delivered: session.kwh_delivered,
                    cost: session.cost.unwrap_or_default(),
                }
            }
            Outcome::Fail(reason) => {
                session.fail();
                EventPayload::SessionFailed {
                    session_id: session.session_id,
                    kwh_delivered: session.kwh_delivered,
                    reason,
                }
            }
        };
        tracing::info!(
            station_id = %session.station_id,
            session_id = %session.session_id,
            status = %session.status,
            kwh_delivered = session.kwh_delivered,
            cost = ?session.cost,
            "session ended"
        );

        self.persist_session(&session);
        self.publisher.emit(&session.station_id, payload);
        self.history.write().await.push(session.clone());
        Some(session)
    }

    /// Completes the bound session and frees the station.
    async fn finish_bound(&self, cell: &mut StationCell, final_kwh: f64) {
        self.resolve_bound(cell, Outcome::Complete(final_kwh)).await;
        if cell.point.status == StationStatus::Charging
            && self.apply(&mut cell.point, StationEvent::EndCharging).is_ok()
        {
            self.publisher.emit(&cell.point.id, EventPayload::StationActivated);
        }
    }

    async fn best_effort(&self, station_id: &str, command: ControlCommand) {
        let name = command.name();
        if let Err(error) = send_with_retry(self.control.as_ref(), self.retry.single_attempt(), station_id, command).await {
            tracing::warn!(station_id, command = name, error = %error, "best-effort command not delivered");
        }
    }

    /// A station that does not answer a command is treated as down.
    async fn escalate(&self, station_id: &str, error: &ControlError) {
        tracing::error!(station_id, error = %error, "station unreachable after retry, treating as down");
        match self.on_station_down(station_id).await {
            Ok(true) => {}
            // STOPPED and ERROR are kept; the next heartbeat or DOWN report settles liveness
            Ok(false) => tracing::warn!(station_id, "unreachable station left in its current state"),
            Err(error) => tracing::warn!(station_id, error = %error, "escalation failed"),
        }
    }

    /// Admits a station that registered over its live control connection.
    /// A known station gets its location and price refreshed.
    pub async fn on_station_registered(
        &self,
        station_id: &str,
        location: Location,
        price_per_kwh: f64,
    ) -> Result<ChargingPoint, CoreError> {
        validate_station(station_id, &location, price_per_kwh)?;
        let now = Utc::now();

        loop {
            let existing = {
                let mut stations = self.stations.write().await;
                match stations.get(station_id) {
                    Some(cell) => cell.clone(),
                    None => {
                        let mut point = ChargingPoint::new(station_id, location, price_per_kwh);
                        point.last_heartbeat = Some(now);
                        self.publisher.emit(
                            station_id,
                            EventPayload::StationRegistered {
                                location,
                                price_per_kwh,
                            },
                        );
                        self.apply(&mut point, StationEvent::Activate)?;
                        self.publisher.emit(station_id, EventPayload::StationActivated);
                        tracing::info!(station_id, %location, price_per_kwh, "station admitted");

                        stations.insert(
                            station_id.to_string(),
                            Arc::new(Mutex::new(StationCell::new(point.clone()))),
                        );
                        return Ok(point);
                    }
                }
            };

            let mut cell = existing.lock().await;
            if cell.removed {
                // lost a race with registry removal, admit it afresh
                drop(cell);
                self.forget(station_id, &existing).await;
                continue;
            }
            cell.point.location = location;
            cell.point.price_per_kwh = price_per_kwh;
            cell.point.last_heartbeat = Some(now);
            self.publisher.emit(
                station_id,
                EventPayload::StationRegistered {
                    location,
                    price_per_kwh,
                },
            );
            self.revive(&mut cell);
            self.persist_point(&cell.point);
            tracing::info!(station_id, status = %cell.point.status, "station re-registered");
            return Ok(cell.point.clone());
        }
    }

    /// Liveness proof: REGISTERED and idle DISCONNECTED points become ACTIVATED.
    fn revive(&self, cell: &mut StationCell) {
        if cell.has_unresolved_session() {
            return;
        }
        let (event, payload) = match cell.point.status {
            StationStatus::Registered => (StationEvent::Activate, EventPayload::StationActivated),
            StationStatus::Disconnected => (StationEvent::Recover, EventPayload::StationRecovered),
            _ => return,
        };
        if self.apply(&mut cell.point, event).is_ok() {
            self.publisher.emit(&cell.point.id, payload);
        }
    }

    pub async fn on_heartbeat(&self, station_id: &str, at: DateTime<Utc>) -> Result<StationStatus, CoreError> {
        let mut cell = self.lock_cell(station_id).await?;
        cell.point.last_heartbeat = Some(at);
        self.revive(&mut cell);
        Ok(cell.point.status)
    }

    pub async fn request_charge(
        &self,
        driver_id: &str,
        station_id: &str,
        kwh_requested: f64,
    ) -> Result<Uuid, CoreError> {
        if !self.is_accepting() {
            return Err(CoreError::unavailable(station_id, "coordinator is shutting down"));
        }
        if driver_id.trim().is_empty() {
            return Err(CoreError::Validation("driver id must not be empty".into()));
        }
        if !kwh_requested.is_finite() || kwh_requested <= 0.0 {
            return Err(CoreError::Validation(format!(
                "requested energy must be positive, got {kwh_requested}"
            )));
        }

        let cell = self.cell(station_id).await?;
        let session_id = {
            let mut guard = cell.lock().await;
            if guard.removed {
                return Err(CoreError::station_not_found(station_id));
            }
            let status = guard.point.status;
            if status.is_unavailable() {
                return Err(CoreError::unavailable(station_id, format!("station is {status}")));
            }
            if !status.accepts_sessions() || guard.has_unresolved_session() {
                return Err(CoreError::Conflict(format!("station {station_id} is busy ({status})")));
            }

            let session = ChargingSession::new(station_id, driver_id, kwh_requested, guard.point.price_per_kwh);
            let session_id = session.session_id;
            self.apply(&mut guard.point, StationEvent::BeginCharging)?;
            self.publisher.emit(
                station_id,
                EventPayload::SessionStarted {
                    session_id,
                    driver_id: driver_id.to_string(),
                    kwh_requested,
                },
            );
            guard.session = Some(session);
            tracing::info!(station_id, %session_id, driver_id, kwh_requested, "charge admitted");
            session_id
        };

        let sent = send_with_retry(
            self.control.as_ref(),
            self.retry,
            station_id,
            ControlCommand::StartSession {
                session_id,
                kwh: kwh_requested,
            },
        )
        .await;

        let mut guard = cell.lock().await;
        let still_pending = guard
            .session
            .as_ref()
            .is_some_and(|session| session.session_id == session_id && session.status == SessionStatus::Pending);
        if !still_pending {
            drop(guard);
            if sent.is_ok() {
                self.best_effort(station_id, ControlCommand::EndSession { session_id }).await;
            }
            return Err(CoreError::unavailable(
                station_id,
                format!("session {session_id} was terminated while starting"),
            ));
        }

        match sent {
            Ok(()) if guard.point.status == StationStatus::Charging => {
                if let Some(session) = guard.session.as_mut() {
                    session.activate();
                }
                tracing::info!(station_id, %session_id, "session active");
                Ok(session_id)
            }
            Ok(()) => {
                // admin stop arrived while the start was in flight
                self.resolve_bound(&mut guard, Outcome::Cancel).await;
                Err(CoreError::unavailable(
                    station_id,
                    "station was stopped while the session was starting",
                ))
            }
            Err(error) => {
                self.resolve_bound(&mut guard, Outcome::Fail(format!("start command failed: {error}")))
                    .await;
                if guard.point.status == StationStatus::Charging
                    && self.apply(&mut guard.point, StationEvent::EndCharging).is_ok()
                {
                    self.publisher.emit(station_id, EventPayload::StationActivated);
                }
                drop(guard);
                if !matches!(error, ControlError::Rejected(_)) {
                    // the engine may have started and lost only the ACK
                    self.best_effort(station_id, ControlCommand::EndSession { session_id }).await;
                    self.escalate(station_id, &error).await;
                }
                Err(error.into_core(station_id))
            }
        }
    }

    /// Applies a delivery reading. Stale or unmatched readings are discarded
    /// with `Ok(false)`.
    pub async fn on_telemetry(
        &self,
        station_id: &str,
        session_id: Uuid,
        kwh_delivered: f64,
    ) -> Result<bool, CoreError> {
        let Ok(mut guard) = self.lock_cell(station_id).await else {
            tracing::debug!(station_id, %session_id, "telemetry for unknown station discarded");
            return Ok(false);
        };
        let Some(session) = guard
            .session
            .as_mut()
            .filter(|session| session.session_id == session_id)
        else {
            tracing::debug!(station_id, %session_id, "telemetry for unbound session discarded");
            return Ok(false);
        };
        if !session.record_delivery(kwh_delivered) {
            tracing::debug!(station_id, %session_id, kwh_delivered, "stale telemetry discarded");
            return Ok(false);
        }

        let delivered = session.kwh_delivered;
        if session.target_reached() {
            self.finish_bound(&mut guard, delivered).await;
        }
        Ok(true)
    }

    pub async fn on_session_complete(
        &self,
        station_id: &str,
        session_id: Uuid,
        final_kwh: f64,
    ) -> Result<bool, CoreError> {
        let Ok(mut guard) = self.lock_cell(station_id).await else {
            return Ok(false);
        };
        let matches = guard
            .session
            .as_ref()
            .is_some_and(|session| session.session_id == session_id && session.status == SessionStatus::Active);
        if !matches {
            tracing::debug!(station_id, %session_id, "duplicate or stale completion discarded");
            return Ok(false);
        }
        self.finish_bound(&mut guard, final_kwh).await;
        Ok(true)
    }

    pub async fn admin_stop(&self, station_id: &str) -> Result<StationStatus, CoreError> {
        {
            let mut guard = self.lock_cell(station_id).await?;
            if guard.point.status == StationStatus::Stopped {
                return Ok(StationStatus::Stopped);
            }
            self.apply(&mut guard.point, StationEvent::Stop)?;
            self.publisher.emit(station_id, EventPayload::StationStopped);
            // a PENDING session stays bound until its start resolves
            if guard
                .session
                .as_ref()
                .is_some_and(|session| session.status == SessionStatus::Active)
            {
                self.resolve_bound(&mut guard, Outcome::Cancel).await;
            }
        }

        if let Err(error) = send_with_retry(self.control.as_ref(), self.retry, station_id, ControlCommand::Stop).await {
            self.escalate(station_id, &error).await;
        }
        Ok(StationStatus::Stopped)
    }

    pub async fn admin_resume(&self, station_id: &str) -> Result<StationStatus, CoreError> {
        {
            let mut guard = self.lock_cell(station_id).await?;
            if guard.point.status == StationStatus::Stopped && guard.has_unresolved_session() {
                return Err(CoreError::Conflict(format!(
                    "station {station_id} still has an unresolved session"
                )));
            }
            self.apply(&mut guard.point, StationEvent::Resume)?;
            self.publisher.emit(station_id, EventPayload::StationResumed);
        }

        if let Err(error) = send_with_retry(self.control.as_ref(), self.retry, station_id, ControlCommand::Resume).await {
            self.escalate(station_id, &error).await;
            return Err(CoreError::TransientNetwork(format!("station {station_id}: {error}")));
        }
        Ok(StationStatus::Activated)
    }

    /// Manual reset out of ERROR.
    pub async fn admin_reset(&self, station_id: &str) -> Result<StationStatus, CoreError> {
        {
            let mut guard = self.lock_cell(station_id).await?;
            self.apply(&mut guard.point, StationEvent::Reset)?;
            self.publisher.emit(station_id, EventPayload::StationActivated);
        }

        if let Err(error) = send_with_retry(self.control.as_ref(), self.retry, station_id, ControlCommand::Resume).await {
            self.escalate(station_id, &error).await;
            return Err(CoreError::TransientNetwork(format!("station {station_id}: {error}")));
        }
        Ok(StationStatus::Activated)
    }

    /// Driver unplug. The engine answers with a completion report.
    pub async fn end_charge(&self, session_id: Uuid) -> Result<(), CoreError> {
        let Some(session) = self.bound_session(session_id).await else {
            return match self.historical_session(session_id).await {
                Some(session) => Err(CoreError::Conflict(format!(
                    "session {session_id} is already {}",
                    session.status
                ))),
                None => Err(CoreError::session_not_found(session_id)),
            };
        };
        if session.status != SessionStatus::Active {
            return Err(CoreError::Conflict(format!("session {session_id} is still starting")));
        }

        let station_id = session.station_id;
        send_with_retry(
            self.control.as_ref(),
            self.retry,
            &station_id,
            ControlCommand::EndSession { session_id },
        )
        .await
        .map_err(|error| error.into_core(&station_id))
    }

    /// Unrecoverable engine fault: the station goes to ERROR.
    pub async fn on_station_fault(&self, station_id: &str, reason: &str) -> Result<(), CoreError> {
        let mut guard = self.lock_cell(station_id).await?;
        self.apply(&mut guard.point, StationEvent::Fault)?;
        self.publisher.emit(
            station_id,
            EventPayload::StationError {
                reason: reason.to_string(),
            },
        );
        self.resolve_bound(&mut guard, Outcome::Fail(format!("station fault: {reason}")))
            .await;
        Ok(())
    }

    /// Monitor DOWN report. Returns whether anything changed.
    pub async fn on_station_down(&self, station_id: &str) -> Result<bool, CoreError> {
        let mut guard = self.lock_cell(station_id).await?;
        let mut changed = false;

        if matches!(
            guard.point.status,
            StationStatus::Registered | StationStatus::Activated | StationStatus::Charging
        ) {
            self.apply(&mut guard.point, StationEvent::Disconnect)?;
            self.publisher.emit(station_id, EventPayload::StationDisconnected);
            changed = true;
        }
        if self
            .resolve_bound(&mut guard, Outcome::Fail("station down".into()))
            .await
            .is_some()
        {
            changed = true;
        }
        if !changed {
            tracing::debug!(station_id, status = %guard.point.status, "repeated down report ignored");
        }
        Ok(changed)
    }

    /// Monitor UP report, handled as a heartbeat after a gap.
    pub async fn on_station_up(&self, station_id: &str) -> Result<StationStatus, CoreError> {
        self.on_heartbeat(station_id, Utc::now()).await
    }

    /// Snapshot of the fleet ordered by station id.
    pub async fn list(&self) -> Vec<ChargingPoint> {
        let mut points = Vec::new();
        for (_, cell) in self.cells().await {
            let guard = cell.lock().await;
            if !guard.removed {
                points.push(guard.point.clone());
            }
        }
        points.sort_by(|a, b| a.id.cmp(&b.id));
        points
    }

    pub async fn station(&self, station_id: &str) -> Result<ChargingPoint, CoreError> {
        let point = self.lock_cell(station_id).await?.point.clone();
        Ok(point)
    }

    /// Terminal sessions, most recent first.
    pub async fn history(&self) -> Vec<ChargingSession> {
        let mut sessions = self.history.read().await.clone();
        sessions.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        sessions
    }

    async fn bound_session(&self, session_id: Uuid) -> Option<ChargingSession> {
        for (_, cell) in self.cells().await {
            let guard = cell.lock().await;
            if let Some(session) = guard.session.as_ref().filter(|session| session.session_id == session_id) {
                return Some(session.clone());
            }
        }
        None
    }

    async fn historical_session(&self, session_id: Uuid) -> Option<ChargingSession> {
        self.history
            .read()
            .await
            .iter()
            .find(|session| session.session_id == session_id)
            .cloned()
    }

    pub async fn session(&self, session_id: Uuid) -> Result<ChargingSession, CoreError> {
        if let Some(session) = self.bound_session(session_id).await {
            return Ok(session);
        }
        self.historical_session(session_id)
            .await
            .ok_or_else(|| CoreError::session_not_found(session_id))
    }

    /// Aligns the fleet with the registry: unknown entries are admitted as
    /// REGISTERED, live stations missing from the registry are removed once
    /// they hold no unresolved session.
    pub async fn reconcile_registry(&self, entries: &[RegistryEntry]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        {
            let mut stations = self.stations.write().await;
            for entry in entries {
                if stations.contains_key(&entry.station_id) {
                    continue;
                }
                let mut point = ChargingPoint::new(entry.station_id.as_str(), entry.location, entry.price_per_kwh);
                point.registered_at = entry.registered_at;
                self.persist_point(&point);
                self.publisher.emit(
                    &entry.station_id,
                    EventPayload::StationRegistered {
                        location: entry.location,
                        price_per_kwh: entry.price_per_kwh,
                    },
                );
                stations.insert(
                    entry.station_id.clone(),
                    Arc::new(Mutex::new(StationCell::new(point))),
                );
                report.admitted.push(entry.station_id.clone());
            }
        }

        let registered: HashSet<&str> = entries.iter().map(|entry| entry.station_id.as_str()).collect();
        for (station_id, cell) in self.cells().await {
            if registered.contains(station_id.as_str()) {
                continue;
            }
            {
                let mut guard = cell.lock().await;
                if guard.removed {
                    continue;
                }
                if guard.has_unresolved_session() {
                    report.deferred.push(station_id);
                    continue;
                }
                guard.removed = true;
                if let Err(error) = self.store.remove(&station_key(&station_id)) {
                    tracing::warn!(station_id = %station_id, error = %error, "failed to remove charging point record");
                }
                self.publisher.emit(&station_id, EventPayload::StationUnregistered);
            }
            self.forget(&station_id, &cell).await;
            report.removed.push(station_id);
        }

        if !report.admitted.is_empty() || !report.removed.is_empty() {
            tracing::info!(
                admitted = report.admitted.len(),
                removed = report.removed.len(),
                deferred = report.deferred.len(),
                "registry reconciled"
            );
        }
        report.removed.sort();
        report.deferred.sort();
        report
    }

    /// Drops `cell` from the directory unless it was already replaced.
    async fn forget(&self, station_id: &str, cell: &Arc<Mutex<StationCell>>) {
        let mut stations = self.stations.write().await;
        if stations.get(station_id).is_some_and(|current| Arc::ptr_eq(current, cell)) {
            stations.remove(station_id);
        }
    }

    /// Reloads charging points and session history from the record store.
    /// Points come back DISCONNECTED until they prove liveness, except
    /// STOPPED and ERROR which need an operator.
    pub async fn restore(&self) -> Result<usize, CoreError> {
        let points: Vec<ChargingPoint> = list_typed(self.store.as_ref(), STATION_PREFIX)?;
        let sessions: Vec<ChargingSession> = list_typed(self.store.as_ref(), SESSION_PREFIX)?;

        let restored = points.len();
        {
            let mut stations = self.stations.write().await;
            for mut point in points {
                if !matches!(point.status, StationStatus::Stopped | StationStatus::Error) {
                    point.status = StationStatus::Disconnected;
                }
                stations.insert(
                    point.id.clone(),
                    Arc::new(Mutex::new(StationCell::new(point))),
                );
            }
        }

        let mut history = self.history.write().await;
        history.extend(sessions.into_iter().filter(|session| session.status.is_terminal()));
        tracing::info!(stations = restored, sessions = history.len(), "fleet restored");
        Ok(restored)
    }

    /// Stops admitting charges, fails every unresolved session and tells all
    /// stations the coordinator is going away.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("coordinator shutting down");

        let cells = self.cells().await;
        for (_, cell) in &cells {
            let mut guard = cell.lock().await;
            self.resolve_bound(&mut guard, Outcome::Fail("coordinator shutdown".into()))
                .await;
        }

        let mut notices = JoinSet::new();
        for (station_id, _) in cells {
            let control = self.control.clone();
            let policy = self.retry.single_attempt();
            notices.spawn(async move {
                if let Err(error) = send_with_retry(control.as_ref(), policy, &station_id, ControlCommand::Disconnect).await {
                    tracing::debug!(station_id = %station_id, error = %error, "disconnect notice not delivered");
                }
            });
        }
        while notices.join_next().await.is_some() {}
    }

    /// Routes one engine report to the matching operation.
    pub async fn apply_engine_event(&self, event: Event) -> Result<(), CoreError> {
        match event.payload {
            EventPayload::Telemetry {
                session_id,
                kwh_delivered,
            } => {
                self.on_telemetry(&event.key, session_id, kwh_delivered).await?;
            }
            EventPayload::SessionFinished { session_id, final_kwh } => {
                self.on_session_complete(&event.key, session_id, final_kwh).await?;
            }
            EventPayload::Fault { reason } => {
                self.on_station_fault(&event.key, &reason).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Consumes engine reports from `bus` on its own task, one stream for
    /// both topics so a station's reports apply in sequence order.
    /// Duplicates are discarded. Ends when the bus is dropped.
    pub fn spawn_event_consumer(self: &Arc<Self>, bus: &dyn EventBus) -> JoinHandle<()> {
        let mut events = bus.subscribe_all();
        let coordinator = Arc::clone(self);

        tokio::spawn(async move {
            let mut tracker = SequenceTracker::new();
            while let Some(event) = events.next().await {
                if event.origin != Origin::Engine {
                    continue;
                }
                match tracker.observe(&event) {
                    Delivery::Duplicate => {
                        tracing::debug!(station_id = %event.key, seq = event.seq, "duplicate event discarded");
                        continue;
                    }
                    Delivery::Gap { missing } => {
                        tracing::warn!(station_id = %event.key, seq = event.seq, missing, "event sequence gap");
                    }
                    Delivery::Fresh => {}
                }
                let station_id = event.key.clone();
                if let Err(error) = coordinator.apply_engine_event(event).await {
                    tracing::warn!(station_id = %station_id, error = %error, "engine report rejected");
                }
            }
            tracing::debug!("event consumer stopped");
        })
    }
}

#[async_trait]
impl LivenessReporter for Coordinator {
    async fn station_down(&self, station_id: &str) -> Result<(), ReportError> {
        self.on_station_down(station_id)
            .await
            .map(|_| ())
            .map_err(|error| ReportError::Rejected(error.to_string()))
    }

    async fn station_up(&self, station_id: &str) -> Result<(), ReportError> {
        self.on_station_up(station_id)
            .await
            .map(|_| ())
            .map_err(|error| ReportError::Rejected(error.to_string()))
    }
}

#[cfg(test)]
mod tests;
