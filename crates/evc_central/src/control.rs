//! Coordinator side of the control channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use evc_core::protocol::{ControlMessage, Envelope};
use evc_core::{CoreError, StationId};
use evc_engine::{EngineError, EngineHandle};
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, oneshot};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    StartSession { session_id: Uuid, kwh: f64 },
    Stop,
    Resume,
    EndSession { session_id: Uuid },
    Disconnect,
}

impl ControlCommand {
    pub fn into_message(self) -> ControlMessage {
        match self {
            ControlCommand::StartSession { session_id, kwh } => {
                ControlMessage::StartSession { session_id, kwh }
            }
            ControlCommand::Stop => ControlMessage::Stop,
            ControlCommand::Resume => ControlMessage::Resume,
            ControlCommand::EndSession { session_id } => ControlMessage::EndSession { session_id },
            ControlCommand::Disconnect => ControlMessage::Disconnect,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::StartSession { .. } => "START_SESSION",
            ControlCommand::Stop => "STOP",
            ControlCommand::Resume => "RESUME",
            ControlCommand::EndSession { .. } => "END_SESSION",
            ControlCommand::Disconnect => "DISCONNECT",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("station unreachable: {0}")]
    Unreachable(String),
    #[error("station rejected command: {0}")]
    Rejected(String),
}

impl ControlError {
    pub fn into_core(self, station_id: &str) -> CoreError {
        match self {
            ControlError::Rejected(reason) => CoreError::unavailable(station_id, reason),
            other => CoreError::TransientNetwork(format!("station {station_id}: {other}")),
        }
    }
}

/// Request/response link from the coordinator to station engines.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Delivers `command` and waits for the engine's ACK.
    async fn send(&self, station_id: &str, command: ControlCommand) -> Result<(), ControlError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            timeout: Duration::from_millis(2000),
            retries: 1,
        }
    }
}

impl RetryPolicy {
    pub fn single_attempt(self) -> Self {
        RetryPolicy { retries: 0, ..self }
    }
}

/// Sends with a bounded timeout per attempt. Rejections are final; timeouts
/// and connection failures are retried up to `policy.retries` times.
pub async fn send_with_retry(
    channel: &dyn ControlChannel,
    policy: RetryPolicy,
    station_id: &str,
    command: ControlCommand,
) -> Result<(), ControlError> {
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(policy.timeout, channel.send(station_id, command.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::Timeout(policy.timeout)),
        };
        match result {
            Ok(()) => return Ok(()),
            Err(ControlError::Rejected(reason)) => return Err(ControlError::Rejected(reason)),
            Err(error) if attempt < policy.retries => {
                attempt += 1;
                tracing::warn!(
                    station_id,
                    command = command.name(),
                    attempt,
                    error = %error,
                    "control command failed, retrying"
                );
            }
            Err(error) => return Err(error),
        }
    }
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<ControlMessage>>>>;

/// Outbound half of one engine connection.
pub struct EngineLink {
    writer: mpsc::Sender<Envelope>,
    pending: PendingReplies,
}

impl EngineLink {
    pub fn new(writer: mpsc::Sender<Envelope>) -> Self {
        EngineLink {
            writer,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<ControlMessage>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fails every command still waiting for a reply on this connection.
    pub fn close(&self) {
        self.pending().clear();
    }
}

/// Removes an abandoned reply slot when the caller stops waiting.
struct ReplySlot {
    pending: PendingReplies,
    correlation: u64,
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.correlation);
    }
}

/// Routes commands to engines connected over TCP and matches their replies by
/// correlation id.
pub struct TcpControlHub {
    links: RwLock<HashMap<StationId, Arc<EngineLink>>>,
    next_correlation: AtomicU64,
}

impl Default for TcpControlHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpControlHub {
    pub fn new() -> Self {
        TcpControlHub {
            links: RwLock::new(HashMap::new()),
            next_correlation: AtomicU64::new(1),
        }
    }

    /// Makes `link` the route to `station_id`, replacing an older connection.
    pub async fn attach(&self, station_id: &str, link: Arc<EngineLink>) {
        let replaced = self.links.write().await.insert(station_id.to_string(), link);
        if replaced.is_some() {
            tracing::info!(station_id, "engine reconnected, previous link replaced");
        }
    }

    /// Drops the route only if it still points at `link`.
    pub async fn detach(&self, station_id: &str, link: &Arc<EngineLink>) {
        let mut links = self.links.write().await;
        if links
            .get(station_id)
            .is_some_and(|current| Arc::ptr_eq(current, link))
        {
            links.remove(station_id);
        }
    }

    pub async fn is_connected(&self, station_id: &str) -> bool {
        self.links.read().await.contains_key(station_id)
    }

    /// Hands an ACK/NACK to the command waiting for it.
    pub fn resolve(link: &EngineLink, reply: Envelope) {
        match link.pending().remove(&reply.correlation) {
            Some(waiter) => {
                let _ = waiter.send(reply.message);
            }
            None => {
                tracing::debug!(
                    station_id = %reply.station_id,
                    correlation = reply.correlation,
                    "late reply discarded"
                );
            }
        }
    }
}

#[async_trait]
impl ControlChannel for TcpControlHub {
    async fn send(&self, station_id: &str, command: ControlCommand) -> Result<(), ControlError> {
        let link = self
            .links
            .read()
            .await
            .get(station_id)
            .cloned()
            .ok_or_else(|| ControlError::Unreachable("engine not connected".into()))?;

        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (waiter, reply) = oneshot::channel();
        link.pending().insert(correlation, waiter);
        let _slot = ReplySlot {
            pending: link.pending.clone(),
            correlation,
        };

        let envelope = Envelope::new(station_id, command.into_message()).with_correlation(correlation);
        link.writer
            .send(envelope)
            .await
            .map_err(|_| ControlError::Unreachable("engine connection closed".into()))?;

        match reply.await {
            Ok(ControlMessage::Ack) => Ok(()),
            Ok(ControlMessage::Nack { reason }) => Err(ControlError::Rejected(reason)),
            Ok(other) => Err(ControlError::Rejected(format!("unexpected reply {}", other.name()))),
            Err(_) => Err(ControlError::Unreachable("engine connection closed".into())),
        }
    }
}

/// Control channel to engines running in the coordinator's own process.
#[derive(Default)]
pub struct LocalControl {
    engines: RwLock<HashMap<StationId, EngineHandle>>,
}

impl LocalControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, engine: EngineHandle) {
        self.engines
            .write()
            .await
            .insert(engine.station_id().to_string(), engine);
    }
}

#[async_trait]
impl ControlChannel for LocalControl {
    async fn send(&self, station_id: &str, command: ControlCommand) -> Result<(), ControlError> {
        let engine = self
            .engines
            .read()
            .await
            .get(station_id)
            .cloned()
            .ok_or_else(|| ControlError::Unreachable("no engine attached".into()))?;

        let result = match command {
            ControlCommand::StartSession { session_id, kwh } => engine.start(session_id, kwh).await,
            ControlCommand::Stop => engine.stop().await,
            ControlCommand::Resume => engine.resume().await,
            ControlCommand::EndSession { session_id } => engine.finish(session_id).await,
            ControlCommand::Disconnect => engine.disconnect().await,
        };
        result.map_err(|error| match error {
            EngineError::Closed => ControlError::Unreachable(error.to_string()),
            other => ControlError::Rejected(other.to_string()),
        })
    }
}
