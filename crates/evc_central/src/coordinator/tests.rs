use super::*;

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use evc_core::bus::{InProcessBus, Topic};
use evc_core::session::bill;
use evc_core::store::MemoryStore;
use evc_engine::StationEngine;
use evc_engine::monitor::{MonitorConfig, ProbeError, Prober, StationMonitor};
use proptest::prelude::*;
use tokio::sync::Notify;

#[derive(Clone)]
enum Reply {
    Ack,
    Reject(&'static str),
    Hang,
    Gate(Arc<Notify>),
}

/// Control channel double: answers per command kind and records every send.
struct FakeControl {
    replies: StdMutex<HashMap<&'static str, Reply>>,
    sent: StdMutex<Vec<(String, ControlCommand)>>,
    entered: Notify,
}

impl FakeControl {
    fn new() -> Arc<Self> {
        Arc::new(FakeControl {
            replies: StdMutex::new(HashMap::new()),
            sent: StdMutex::new(Vec::new()),
            entered: Notify::new(),
        })
    }

    fn on(&self, command: &'static str, reply: Reply) {
        self.replies.lock().unwrap().insert(command, reply);
    }

    fn count(&self, command: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, sent)| sent.name() == command)
            .count()
    }
}

#[async_trait]
impl ControlChannel for FakeControl {
    async fn send(&self, station_id: &str, command: ControlCommand) -> Result<(), ControlError> {
        let reply = {
            let replies = self.replies.lock().unwrap();
            replies.get(command.name()).cloned().unwrap_or(Reply::Ack)
        };
        self.sent.lock().unwrap().push((station_id.to_string(), command));
        self.entered.notify_one();

        match reply {
            Reply::Ack => Ok(()),
            Reply::Reject(reason) => Err(ControlError::Rejected(reason.into())),
            Reply::Hang => std::future::pending().await,
            Reply::Gate(gate) => {
                gate.notified().await;
                Ok(())
            }
        }
    }
}

struct Harness {
    coordinator: Arc<Coordinator>,
    control: Arc<FakeControl>,
    bus: Arc<InProcessBus>,
    store: Arc<MemoryStore>,
}

fn harness() -> Harness {
    let control = FakeControl::new();
    let bus = Arc::new(InProcessBus::default());
    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        bus.clone(),
        control.clone(),
        RetryPolicy {
            timeout: Duration::from_millis(100),
            retries: 1,
        },
    ));
    Harness {
        coordinator,
        control,
        bus,
        store,
    }
}

async fn register(coordinator: &Coordinator, station_id: &str) {
    coordinator
        .on_station_registered(station_id, Location::new(40.5, -3.1), 0.30)
        .await
        .unwrap();
}

async fn status(coordinator: &Coordinator, station_id: &str) -> StationStatus {
    coordinator.station(station_id).await.unwrap().status
}

#[tokio::test]
async fn test_scenario_a_registration_activates_station() {
    let h = harness();
    let mut events = h.bus.subscribe(Topic::Station);

    let point = h
        .coordinator
        .on_station_registered("CP-001", Location::new(40.5, -3.1), 0.30)
        .await
        .unwrap();
    assert_eq!(point.status, StationStatus::Activated);
    assert!(point.last_heartbeat.is_some());

    let registered = events.next().await.unwrap();
    assert_eq!(registered.origin, Origin::Coordinator);
    assert!(matches!(registered.payload, EventPayload::StationRegistered { .. }));
    assert_eq!(events.next().await.unwrap().payload, EventPayload::StationActivated);

    let stored = h.store.get("station/CP-001").unwrap().unwrap();
    assert_eq!(stored["status"], "ACTIVATED");
}

#[tokio::test]
async fn test_scenario_b_and_c_charge_to_completion() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;

    let session_id = h.coordinator.request_charge("D1", "CP-001", 15.0).await.unwrap();
    let session = h.coordinator.session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Charging);
    assert_eq!(h.control.count("START_SESSION"), 1);

    for kwh in [5.0, 10.0] {
        assert!(h.coordinator.on_telemetry("CP-001", session_id, kwh).await.unwrap());
    }
    assert!(h.coordinator.on_telemetry("CP-001", session_id, 15.0).await.unwrap());

    let session = h.coordinator.session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.cost, Some(4.50));
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Activated);

    // duplicate completion after the fact is discarded
    assert!(!h.coordinator.on_session_complete("CP-001", session_id, 15.0).await.unwrap());
    assert_eq!(h.coordinator.history().await.len(), 1);
    assert!(h.store.get(&format!("session/{session_id}")).unwrap().is_some());
}

#[tokio::test]
async fn test_scenario_d_admin_stop_cancels_active_session() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    let session_id = h.coordinator.request_charge("D1", "CP-001", 15.0).await.unwrap();
    h.coordinator.on_telemetry("CP-001", session_id, 5.0).await.unwrap();

    assert_eq!(h.coordinator.admin_stop("CP-001").await, Ok(StationStatus::Stopped));

    let session = h.coordinator.session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert_eq!(session.cost, Some(1.50));
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Stopped);
    assert_eq!(h.control.count("STOP"), 1);

    // the engine's final reading arrives after the cancellation
    assert!(!h.coordinator.on_telemetry("CP-001", session_id, 5.5).await.unwrap());
    assert_eq!(h.coordinator.session(session_id).await.unwrap().cost, Some(1.50));

    // stopping again is a no-op
    assert_eq!(h.coordinator.admin_stop("CP-001").await, Ok(StationStatus::Stopped));
    assert_eq!(h.control.count("STOP"), 1);
}

#[tokio::test]
async fn test_scenario_e_down_fails_session_once_and_up_restores() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    let session_id = h.coordinator.request_charge("D1", "CP-001", 15.0).await.unwrap();

    assert_eq!(h.coordinator.on_station_down("CP-001").await, Ok(true));
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Disconnected);
    assert_eq!(
        h.coordinator.session(session_id).await.unwrap().status,
        SessionStatus::Failed
    );

    assert_eq!(h.coordinator.on_station_down("CP-001").await, Ok(false));
    let failed = h
        .coordinator
        .history()
        .await
        .into_iter()
        .filter(|session| session.status == SessionStatus::Failed)
        .count();
    assert_eq!(failed, 1);

    assert_eq!(
        h.coordinator.on_station_up("CP-001").await,
        Ok(StationStatus::Activated)
    );
}

struct SwitchProber {
    alive: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl Prober for SwitchProber {
    async fn probe(&self) -> Result<(), ProbeError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProbeError::Ko)
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_monitor_reports_drive_liveness() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    let session_id = h.coordinator.request_charge("D1", "CP-001", 15.0).await.unwrap();

    let prober = Arc::new(SwitchProber {
        alive: std::sync::atomic::AtomicBool::new(false),
    });
    let mut monitor = StationMonitor::new(
        "CP-001",
        MonitorConfig::default(),
        prober.clone(),
        h.coordinator.clone(),
    );

    monitor.probe_once().await;
    monitor.probe_once().await;
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Charging);
    monitor.probe_once().await;
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Disconnected);
    assert_eq!(
        h.coordinator.session(session_id).await.unwrap().status,
        SessionStatus::Failed
    );

    prober.alive.store(true, Ordering::SeqCst);
    monitor.probe_once().await;
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Activated);
}

#[tokio::test]
async fn test_request_charge_rejections() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;

    assert!(matches!(
        h.coordinator.request_charge("D1", "CP-001", 0.0).await,
        Err(CoreError::Validation(_))
    ));
    assert!(matches!(
        h.coordinator.request_charge("D1", "CP-001", f64::INFINITY).await,
        Err(CoreError::Validation(_))
    ));
    assert!(matches!(
        h.coordinator.request_charge("", "CP-001", 10.0).await,
        Err(CoreError::Validation(_))
    ));
    assert_eq!(
        h.coordinator.request_charge("D1", "CP-404", 10.0).await,
        Err(CoreError::station_not_found("CP-404"))
    );

    h.coordinator.request_charge("D1", "CP-001", 10.0).await.unwrap();
    assert!(matches!(
        h.coordinator.request_charge("D2", "CP-001", 10.0).await,
        Err(CoreError::Conflict(_))
    ));

    h.coordinator.admin_stop("CP-001").await.unwrap();
    assert!(matches!(
        h.coordinator.request_charge("D2", "CP-001", 10.0).await,
        Err(CoreError::Unavailable { .. })
    ));
}

#[tokio::test]
async fn test_registry_admitted_station_is_busy_until_heartbeat() {
    let h = harness();
    let entry = RegistryEntry {
        station_id: "CP-002".into(),
        username: "cp_user_12345678".into(),
        location: Location::new(41.0, 2.0),
        price_per_kwh: 0.25,
        registered_at: Utc::now(),
    };
    let report = h.coordinator.reconcile_registry(&[entry]).await;
    assert_eq!(report.admitted, vec!["CP-002".to_string()]);
    assert_eq!(status(&h.coordinator, "CP-002").await, StationStatus::Registered);

    assert!(matches!(
        h.coordinator.request_charge("D1", "CP-002", 10.0).await,
        Err(CoreError::Conflict(_))
    ));
    assert_eq!(
        h.coordinator.on_heartbeat("CP-002", Utc::now()).await,
        Ok(StationStatus::Activated)
    );
    assert!(h.coordinator.request_charge("D1", "CP-002", 10.0).await.is_ok());
    assert_eq!(
        h.coordinator.on_heartbeat("CP-404", Utc::now()).await,
        Err(CoreError::station_not_found("CP-404"))
    );
}

#[tokio::test]
async fn test_stop_while_pending_cancels_after_ack() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    let gate = Arc::new(Notify::new());
    h.control.on("START_SESSION", Reply::Gate(gate.clone()));

    let request = {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move { coordinator.request_charge("D1", "CP-001", 15.0).await })
    };
    h.control.entered.notified().await;

    assert_eq!(h.coordinator.admin_stop("CP-001").await, Ok(StationStatus::Stopped));
    assert!(matches!(
        h.coordinator.admin_resume("CP-001").await,
        Err(CoreError::Conflict(_))
    ));

    gate.notify_one();
    let result = request.await.unwrap();
    assert!(matches!(result, Err(CoreError::Unavailable { .. })));

    let history = h.coordinator.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, SessionStatus::Cancelled);
    assert_eq!(history[0].kwh_delivered, 0.0);
    assert_eq!(history[0].cost, Some(0.0));

    assert_eq!(
        h.coordinator.admin_resume("CP-001").await,
        Ok(StationStatus::Activated)
    );
}

#[tokio::test]
async fn test_resume_requires_stopped_station() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    assert!(matches!(
        h.coordinator.admin_resume("CP-001").await,
        Err(CoreError::FatalState {
            from: StationStatus::Activated,
            ..
        })
    ));
    assert!(matches!(
        h.coordinator.admin_resume("CP-404").await,
        Err(CoreError::NotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_start_timeout_fails_session_and_treats_station_as_down() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    h.control.on("START_SESSION", Reply::Hang);

    let result = h.coordinator.request_charge("D1", "CP-001", 15.0).await;
    assert!(matches!(result, Err(CoreError::TransientNetwork(_))));
    assert_eq!(h.control.count("START_SESSION"), 2);
    assert_eq!(h.control.count("END_SESSION"), 1);
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Disconnected);

    let history = h.coordinator.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, SessionStatus::Failed);
    assert_eq!(history[0].cost, Some(0.0));

    // the next heartbeat proves liveness again
    assert_eq!(
        h.coordinator.on_heartbeat("CP-001", Utc::now()).await,
        Ok(StationStatus::Activated)
    );
}

/// Runs the real engine state machine but never acknowledges START.
struct AcklessEngine {
    engine: StdMutex<StationEngine>,
    sent: StdMutex<Vec<&'static str>>,
}

#[async_trait]
impl ControlChannel for AcklessEngine {
    async fn send(&self, _station_id: &str, command: ControlCommand) -> Result<(), ControlError> {
        self.sent.lock().unwrap().push(command.name());
        match command {
            ControlCommand::StartSession { session_id, kwh } => {
                let _ = self.engine.lock().unwrap().start(session_id, kwh);
                std::future::pending().await
            }
            ControlCommand::EndSession { session_id } => {
                self.engine.lock().unwrap().finish(session_id);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_lost_start_ack_does_not_leave_engine_charging() {
    let engine = Arc::new(AcklessEngine {
        engine: StdMutex::new(StationEngine::new("CP-001", 1.0)),
        sent: StdMutex::new(Vec::new()),
    });
    let coordinator = Coordinator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(InProcessBus::default()),
        engine.clone(),
        RetryPolicy {
            timeout: Duration::from_millis(100),
            retries: 1,
        },
    );
    register(&coordinator, "CP-001").await;

    assert!(matches!(
        coordinator.request_charge("D1", "CP-001", 10.0).await,
        Err(CoreError::TransientNetwork(_))
    ));

    {
        let engine = engine.engine.lock().unwrap();
        assert_eq!(engine.charge(), None);
        assert_eq!(engine.status(), StationStatus::Activated);
    }
    assert_eq!(
        *engine.sent.lock().unwrap(),
        vec!["START_SESSION", "START_SESSION", "END_SESSION"]
    );
    assert_eq!(status(&coordinator, "CP-001").await, StationStatus::Disconnected);
    assert!(matches!(
        coordinator.request_charge("D2", "CP-001", 10.0).await,
        Err(CoreError::Unavailable { .. })
    ));
    assert_eq!(coordinator.history().await.len(), 1);
}

#[tokio::test]
async fn test_rejected_start_is_unavailable() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    h.control.on("START_SESSION", Reply::Reject("connector fault"));

    let result = h.coordinator.request_charge("D1", "CP-001", 15.0).await;
    assert!(matches!(result, Err(CoreError::Unavailable { reason, .. }) if reason == "connector fault"));
    assert_eq!(h.control.count("START_SESSION"), 1);
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Activated);
}

#[tokio::test(start_paused = true)]
async fn test_down_during_start_resolves_session_once() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    let gate = Arc::new(Notify::new());
    h.control.on("START_SESSION", Reply::Gate(gate.clone()));

    let request = {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move { coordinator.request_charge("D1", "CP-001", 15.0).await })
    };
    h.control.entered.notified().await;
    assert_eq!(h.coordinator.on_station_down("CP-001").await, Ok(true));

    gate.notify_one();
    assert!(matches!(
        request.await.unwrap(),
        Err(CoreError::Unavailable { .. })
    ));
    // the engine acknowledged, so it is told to end the orphaned session
    assert_eq!(h.control.count("END_SESSION"), 1);
    assert_eq!(h.coordinator.history().await.len(), 1);
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_admit_exactly_one() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;

    let mut requests = JoinSet::new();
    for driver in 0..16 {
        let coordinator = h.coordinator.clone();
        requests.spawn(async move {
            coordinator
                .request_charge(&format!("D{driver}"), "CP-001", 10.0)
                .await
        });
    }

    let mut admitted = 0;
    while let Some(result) = requests.join_next().await {
        match result.unwrap() {
            Ok(_) => admitted += 1,
            Err(CoreError::Conflict(_)) | Err(CoreError::Unavailable { .. }) => {}
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Charging);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_stop_keeps_station_stopped() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    h.control.on("STOP", Reply::Hang);
    let mut events = h.bus.subscribe(Topic::Station);

    assert_eq!(h.coordinator.admin_stop("CP-001").await, Ok(StationStatus::Stopped));
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Stopped);
    assert_eq!(h.control.count("STOP"), 2);

    assert_eq!(events.next().await.unwrap().payload, EventPayload::StationStopped);
    // no lifecycle event without a transition
    assert!(
        tokio::time::timeout(Duration::from_millis(50), events.next())
            .await
            .is_err()
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_resume_disconnects() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    h.coordinator.admin_stop("CP-001").await.unwrap();
    h.control.on("RESUME", Reply::Hang);

    assert!(matches!(
        h.coordinator.admin_resume("CP-001").await,
        Err(CoreError::TransientNetwork(_))
    ));
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Disconnected);
}

#[tokio::test]
async fn test_fault_and_manual_reset() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    let session_id = h.coordinator.request_charge("D1", "CP-001", 15.0).await.unwrap();
    h.coordinator.on_telemetry("CP-001", session_id, 2.0).await.unwrap();

    h.coordinator.on_station_fault("CP-001", "overheating").await.unwrap();
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Error);
    let session = h.coordinator.session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.cost, Some(0.60));

    // DOWN never overrides ERROR
    assert_eq!(h.coordinator.on_station_down("CP-001").await, Ok(false));
    assert!(matches!(
        h.coordinator.admin_stop("CP-001").await,
        Err(CoreError::FatalState { .. })
    ));

    assert_eq!(
        h.coordinator.admin_reset("CP-001").await,
        Ok(StationStatus::Activated)
    );
    assert_eq!(h.control.count("RESUME"), 1);
    assert!(matches!(
        h.coordinator.admin_reset("CP-001").await,
        Err(CoreError::FatalState { .. })
    ));
}

#[tokio::test]
async fn test_end_charge_forwards_unplug() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    let session_id = h.coordinator.request_charge("D1", "CP-001", 15.0).await.unwrap();

    h.coordinator.end_charge(session_id).await.unwrap();
    assert_eq!(h.control.count("END_SESSION"), 1);

    h.coordinator.on_session_complete("CP-001", session_id, 7.0).await.unwrap();
    assert!(matches!(
        h.coordinator.end_charge(session_id).await,
        Err(CoreError::Conflict(_))
    ));
    assert_eq!(
        h.coordinator.end_charge(Uuid::nil()).await,
        Err(CoreError::session_not_found(Uuid::nil()))
    );
    assert_eq!(h.coordinator.session(session_id).await.unwrap().cost, Some(2.10));
}

#[tokio::test]
async fn test_list_and_history_ordering() {
    let h = harness();
    register(&h.coordinator, "CP-002").await;
    register(&h.coordinator, "CP-001").await;

    let ids: Vec<String> = h.coordinator.list().await.into_iter().map(|point| point.id).collect();
    assert_eq!(ids, vec!["CP-001", "CP-002"]);

    let first = h.coordinator.request_charge("D1", "CP-001", 5.0).await.unwrap();
    h.coordinator.on_session_complete("CP-001", first, 5.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.coordinator.request_charge("D2", "CP-002", 5.0).await.unwrap();
    h.coordinator.admin_stop("CP-002").await.unwrap();

    let history: Vec<Uuid> = h.coordinator.history().await.into_iter().map(|s| s.session_id).collect();
    assert_eq!(history, vec![second, first]);
}

#[tokio::test]
async fn test_shutdown_fails_sessions_and_notifies_stations() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    register(&h.coordinator, "CP-002").await;
    let session_id = h.coordinator.request_charge("D1", "CP-001", 15.0).await.unwrap();

    h.coordinator.shutdown().await;

    assert_eq!(
        h.coordinator.session(session_id).await.unwrap().status,
        SessionStatus::Failed
    );
    assert_eq!(h.control.count("DISCONNECT"), 2);
    assert!(!h.coordinator.is_accepting());
    assert!(matches!(
        h.coordinator.request_charge("D2", "CP-002", 5.0).await,
        Err(CoreError::Unavailable { .. })
    ));

    h.coordinator.shutdown().await;
    assert_eq!(h.control.count("DISCONNECT"), 2);
}

#[tokio::test]
async fn test_restore_reloads_fleet_and_history() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    register(&h.coordinator, "CP-002").await;
    let session_id = h.coordinator.request_charge("D1", "CP-001", 5.0).await.unwrap();
    h.coordinator.on_telemetry("CP-001", session_id, 5.0).await.unwrap();
    h.coordinator.admin_stop("CP-002").await.unwrap();

    let restarted = Coordinator::new(
        h.store.clone(),
        h.bus.clone(),
        h.control.clone(),
        RetryPolicy::default(),
    );
    assert_eq!(restarted.restore().await, Ok(2));
    assert_eq!(status(&restarted, "CP-001").await, StationStatus::Disconnected);
    assert_eq!(status(&restarted, "CP-002").await, StationStatus::Stopped);

    let history = restarted.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].cost, Some(1.50));
}

#[tokio::test]
async fn test_reconcile_removes_stale_stations() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    register(&h.coordinator, "CP-002").await;
    let session_id = h.coordinator.request_charge("D1", "CP-002", 5.0).await.unwrap();

    let report = h.coordinator.reconcile_registry(&[]).await;
    assert_eq!(report.removed, vec!["CP-001".to_string()]);
    assert_eq!(report.deferred, vec!["CP-002".to_string()]);
    assert!(h.store.get("station/CP-001").unwrap().is_none());

    h.coordinator.on_session_complete("CP-002", session_id, 5.0).await.unwrap();
    let report = h.coordinator.reconcile_registry(&[]).await;
    assert_eq!(report.removed, vec!["CP-002".to_string()]);
    assert!(h.coordinator.list().await.is_empty());
}

#[tokio::test]
async fn test_reconcile_removal_wins_over_queued_request() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;

    let cell = h.coordinator.cell("CP-001").await.unwrap();
    let held = cell.lock().await;

    let reconcile = {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move { coordinator.reconcile_registry(&[]).await })
    };
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    let request = {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move { coordinator.request_charge("D1", "CP-001", 10.0).await })
    };
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    drop(held);

    let report = reconcile.await.unwrap();
    assert_eq!(report.removed, vec!["CP-001".to_string()]);
    assert_eq!(
        request.await.unwrap(),
        Err(CoreError::station_not_found("CP-001"))
    );
    assert_eq!(h.control.count("START_SESSION"), 0);
    assert!(h.coordinator.list().await.is_empty());

    // a later REGISTER brings the station back
    register(&h.coordinator, "CP-001").await;
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Activated);
}

#[tokio::test]
async fn test_event_consumer_applies_station_reports_in_order() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    let session_id = h.coordinator.request_charge("D1", "CP-001", 15.0).await.unwrap();
    let consumer = h.coordinator.spawn_event_consumer(h.bus.as_ref());

    let engine = Publisher::with_epoch(h.bus.clone(), Origin::Engine, 4);
    for kwh in [3.0, 6.0] {
        engine.emit(
            "CP-001",
            EventPayload::Telemetry {
                session_id,
                kwh_delivered: kwh,
            },
        );
    }
    engine.emit(
        "CP-001",
        EventPayload::Fault {
            reason: "ground fault".into(),
        },
    );

    for _ in 0..100 {
        if !h.coordinator.history().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let session = h.coordinator.session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.kwh_delivered, 6.0);
    assert_eq!(session.cost, Some(1.80));
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Error);
    consumer.abort();
}

#[tokio::test]
async fn test_event_consumer_applies_engine_reports_once() {
    let h = harness();
    register(&h.coordinator, "CP-001").await;
    let session_id = h.coordinator.request_charge("D1", "CP-001", 15.0).await.unwrap();
    let consumer = h.coordinator.spawn_event_consumer(h.bus.as_ref());

    let engine = Publisher::with_epoch(h.bus.clone(), Origin::Engine, 9);
    let reading = engine.emit(
        "CP-001",
        EventPayload::Telemetry {
            session_id,
            kwh_delivered: 4.0,
        },
    );
    // redelivery of the same reading
    h.bus.publish(reading).unwrap();
    engine.emit(
        "CP-001",
        EventPayload::SessionFinished {
            session_id,
            final_kwh: 6.0,
        },
    );

    for _ in 0..100 {
        if !h.coordinator.history().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let session = h.coordinator.session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.cost, Some(1.80));
    assert_eq!(status(&h.coordinator, "CP-001").await, StationStatus::Activated);
    consumer.abort();
}

#[tokio::test]
async fn test_local_engine_delivers_to_completion() {
    use evc_engine::runtime::{EngineConfig, spawn};

    use crate::control::LocalControl;

    let bus = Arc::new(InProcessBus::default());
    let control = Arc::new(LocalControl::new());
    let coordinator = Arc::new(Coordinator::new(
        Arc::new(MemoryStore::new()),
        bus.clone(),
        control.clone(),
        RetryPolicy::default(),
    ));
    let consumer = coordinator.spawn_event_consumer(bus.as_ref());

    let (_stop, shutdown) = tokio::sync::watch::channel(false);
    let publisher = Arc::new(Publisher::new(bus.clone(), Origin::Engine));
    let config = EngineConfig {
        telemetry_interval: Duration::from_millis(10),
        kwh_per_tick: 2.5,
    };
    let (engine, _) = spawn(StationEngine::new("CP-001", 2.5), config, publisher, shutdown);
    control.attach(engine).await;
    register(&coordinator, "CP-001").await;

    let session_id = coordinator.request_charge("D1", "CP-001", 10.0).await.unwrap();
    for _ in 0..200 {
        if !coordinator.history().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let session = coordinator.session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.kwh_delivered, 10.0);
    assert_eq!(session.cost, Some(3.0));
    assert_eq!(status(&coordinator, "CP-001").await, StationStatus::Activated);
    consumer.abort();
}

#[derive(Debug, Clone)]
enum Op {
    Request(f64),
    Telemetry(f64),
    Complete(f64),
    Stop,
    Resume,
    Down,
    Up,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1.0f64..30.0).prop_map(Op::Request),
        (0.0f64..30.0).prop_map(Op::Telemetry),
        (0.0f64..30.0).prop_map(Op::Complete),
        Just(Op::Stop),
        Just(Op::Resume),
        Just(Op::Down),
        Just(Op::Up),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_any_operation_sequence_keeps_one_active_session(ops in prop::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let h = harness();
            register(&h.coordinator, "CP-001").await;
            let mut current: Option<Uuid> = None;

            for op in ops {
                match op {
                    Op::Request(kwh) => {
                        if let Ok(id) = h.coordinator.request_charge("D1", "CP-001", kwh).await {
                            current = Some(id);
                        }
                    }
                    Op::Telemetry(kwh) => {
                        if let Some(id) = current {
                            let _ = h.coordinator.on_telemetry("CP-001", id, kwh).await;
                        }
                    }
                    Op::Complete(kwh) => {
                        if let Some(id) = current {
                            let _ = h.coordinator.on_session_complete("CP-001", id, kwh).await;
                        }
                    }
                    Op::Stop => { let _ = h.coordinator.admin_stop("CP-001").await; }
                    Op::Resume => { let _ = h.coordinator.admin_resume("CP-001").await; }
                    Op::Down => { let _ = h.coordinator.on_station_down("CP-001").await; }
                    Op::Up => { let _ = h.coordinator.on_station_up("CP-001").await; }
                }

                let station = status(&h.coordinator, "CP-001").await;
                let history = h.coordinator.history().await;
                let bound = match current {
                    Some(id) => h.coordinator.bound_session(id).await,
                    None => None,
                };

                assert!(history.iter().all(|session| session.status.is_terminal()));
                for session in &history {
                    assert_eq!(session.cost, Some(bill(session.kwh_delivered, session.price_per_kwh)));
                }
                match bound {
                    Some(session) => {
                        assert_eq!(session.status, SessionStatus::Active);
                        assert_eq!(station, StationStatus::Charging);
                    }
                    None => assert_ne!(station, StationStatus::Charging),
                }
            }
        });
    }
}
