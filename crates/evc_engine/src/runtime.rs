//! Async driver around [`StationEngine`].
//!
//! A single task owns the engine; commands arrive over an mpsc channel with
//! oneshot replies and delivery advances on a fixed tick. Reports go out
//! through the event [`Publisher`].

use std::sync::Arc;
use std::time::Duration;

use evc_core::StationStatus;
use evc_core::bus::{EventPayload, Publisher};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::{EngineError, EngineSnapshot, StationEngine};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub telemetry_interval: Duration,
    pub kwh_per_tick: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            telemetry_interval: Duration::from_millis(1000),
            kwh_per_tick: 0.5,
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum EngineRequest {
    Start {
        session_id: Uuid,
        kwh: f64,
        reply: Reply<Result<(), EngineError>>,
    },
    Finish {
        session_id: Uuid,
        reply: Reply<()>,
    },
    Stop {
        reply: Reply<Result<(), EngineError>>,
    },
    Resume {
        reply: Reply<Result<(), EngineError>>,
    },
    Fault {
        reason: String,
        reply: Reply<()>,
    },
    Outage {
        down: bool,
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Probe {
        reply: Reply<bool>,
    },
    Snapshot {
        reply: Reply<EngineSnapshot>,
    },
}

#[derive(Clone)]
pub struct EngineHandle {
    station_id: String,
    requests: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        response.await.map_err(|_| EngineError::Closed)
    }

    pub async fn start(&self, session_id: Uuid, kwh: f64) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Start {
            session_id,
            kwh,
            reply,
        })
        .await?
    }

    pub async fn finish(&self, session_id: Uuid) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Finish { session_id, reply })
            .await
    }

    pub async fn stop(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Stop { reply }).await?
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Resume { reply }).await?
    }

    pub async fn fault(&self, reason: impl Into<String>) -> Result<(), EngineError> {
        let reason = reason.into();
        self.call(|reply| EngineRequest::Fault { reason, reply })
            .await
    }

    pub async fn set_outage(&self, down: bool) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Outage { down, reply })
            .await
    }

    pub async fn disconnect(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Disconnect { reply }).await
    }

    /// `false` when the engine is in a simulated outage or no longer running.
    pub async fn probe(&self) -> bool {
        self.call(|reply| EngineRequest::Probe { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        self.call(|reply| EngineRequest::Snapshot { reply }).await
    }

    pub async fn status(&self) -> Result<StationStatus, EngineError> {
        Ok(self.snapshot().await?.status)
    }
}

/// Spawns the engine task. It runs until `shutdown` flips to `true` or every
/// handle is dropped.
pub fn spawn(
    engine: StationEngine,
    config: EngineConfig,
    publisher: Arc<Publisher>,
    mut shutdown: watch::Receiver<bool>,
) -> (EngineHandle, JoinHandle<()>) {
    let (requests, mut inbox) = mpsc::channel(32);
    let handle = EngineHandle {
        station_id: engine.station_id().to_string(),
        requests,
    };

    let task = tokio::spawn(async move {
        let mut engine = engine;
        let mut ticker = tokio::time::interval(config.telemetry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick of an interval completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                request = inbox.recv() => {
                    let Some(request) = request else { break };
                    handle_request(&mut engine, &publisher, request);
                }
                _ = ticker.tick() => {
                    for report in engine.tick() {
                        publisher.emit(engine.station_id(), report);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(station_id = %engine.station_id(), "engine stopped");
    });

    (handle, task)
}

fn handle_request(engine: &mut StationEngine, publisher: &Publisher, request: EngineRequest) {
    let station_id = engine.station_id().to_string();
    let emit = |report: Option<EventPayload>| {
        if let Some(report) = report {
            publisher.emit(&station_id, report);
        }
    };

    match request {
        EngineRequest::Start {
            session_id,
            kwh,
            reply,
        } => {
            let _ = reply.send(engine.start(session_id, kwh));
        }
        EngineRequest::Finish { session_id, reply } => {
            emit(engine.finish(session_id));
            let _ = reply.send(());
        }
        EngineRequest::Stop { reply } => {
            let result = engine.stop().map(|report| emit(report));
            let _ = reply.send(result);
        }
        EngineRequest::Resume { reply } => {
            let _ = reply.send(engine.resume());
        }
        EngineRequest::Fault { reason, reply } => {
            emit(Some(engine.fault(reason)));
            let _ = reply.send(());
        }
        EngineRequest::Outage { down, reply } => {
            engine.set_outage(down);
            let _ = reply.send(());
        }
        EngineRequest::Disconnect { reply } => {
            engine.disconnect();
            let _ = reply.send(());
        }
        EngineRequest::Probe { reply } => {
            let _ = reply.send(engine.probe());
        }
        EngineRequest::Snapshot { reply } => {
            let _ = reply.send(engine.snapshot());
        }
    }
}
