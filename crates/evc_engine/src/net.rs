//! TCP plumbing on the station side: the engine's uplink to the coordinator,
//! the probe endpoint, and the monitor's probe and report clients.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use evc_core::bus::{BusError, Event, EventPublisher};
use evc_core::protocol::{ControlMessage, Envelope, FrameError, FrameReader, write_envelope};
use evc_core::{Location, StationId};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::EngineHandle;
use crate::monitor::{LivenessReporter, ProbeError, Prober, ReportError};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("coordinator rejected registration: {0}")]
    Rejected(String),
    #[error("coordinator closed the connection")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

/// Event publisher that forwards engine reports to the coordinator link.
///
/// Reports are queued while the link is down and re-sent until the
/// coordinator acknowledges them.
pub struct UplinkBus {
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl UplinkBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (outbox, queued) = mpsc::unbounded_channel();
        (UplinkBus { outbox }, queued)
    }
}

impl EventPublisher for UplinkBus {
    fn publish(&self, event: Event) -> Result<(), BusError> {
        let Some(envelope) = Envelope::from_engine_event(&event) else {
            return Ok(());
        };
        self.outbox
            .send(envelope)
            .map_err(|_| BusError::Uplink("station link stopped".into()))
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub station_id: StationId,
    pub central_addr: String,
    pub location: Location,
    pub price_per_kwh: f64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

enum Disconnect {
    Shutdown,
    Lost(LinkError),
}

/// Keeps the engine connected to the coordinator: registers, sends heartbeats,
/// executes commands and delivers queued reports.
pub struct StationLink {
    config: LinkConfig,
    engine: EngineHandle,
    outbox: mpsc::UnboundedReceiver<Envelope>,
    unacked: BTreeMap<u64, Envelope>,
    next_correlation: u64,
}

impl StationLink {
    pub fn new(
        config: LinkConfig,
        engine: EngineHandle,
        outbox: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        StationLink {
            config,
            engine,
            outbox,
            unacked: BTreeMap::new(),
            next_correlation: 1,
        }
    }

    fn correlation(&mut self) -> u64 {
        let correlation = self.next_correlation;
        self.next_correlation += 1;
        correlation
    }

    /// Reconnects until `shutdown` flips or the coordinator refuses the
    /// station's credentials.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), LinkError> {
        let station_id = self.config.station_id.clone();
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match TcpStream::connect(&self.config.central_addr).await {
                Ok(stream) => {
                    tracing::info!(station_id = %station_id, addr = %self.config.central_addr, "connected to coordinator");
                    let (reader, writer) = stream.into_split();
                    match self.serve(reader, writer, &mut shutdown).await {
                        Disconnect::Shutdown => return Ok(()),
                        Disconnect::Lost(LinkError::Rejected(reason)) => {
                            return Err(LinkError::Rejected(reason));
                        }
                        Disconnect::Lost(error) => {
                            tracing::warn!(station_id = %station_id, error = %error, "coordinator link lost");
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(station_id = %station_id, error = %error, "coordinator unreachable");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn serve<R, W>(
        &mut self,
        reader: R,
        mut writer: W,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Disconnect
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut frames = FrameReader::new(reader);
        let register_correlation = self.correlation();
        let register = Envelope::new(
            self.config.station_id.clone(),
            ControlMessage::Register {
                location: self.config.location,
                price_per_kwh: self.config.price_per_kwh,
                username: self.config.username.clone(),
                password: self.config.password.clone(),
            },
        )
        .with_correlation(register_correlation);
        if let Err(error) = write_envelope(&mut writer, &register).await {
            return Disconnect::Lost(error.into());
        }

        // reports not acknowledged on the previous connection
        for envelope in self.unacked.values() {
            if let Err(error) = write_envelope(&mut writer, envelope).await {
                return Disconnect::Lost(error.into());
            }
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            let result = tokio::select! {
                _ = heartbeat.tick() => self.send_heartbeat(&mut writer).await,
                queued = self.outbox.recv() => match queued {
                    Some(envelope) => self.send_report(&mut writer, envelope).await,
                    None => return Disconnect::Shutdown,
                },
                frame = frames.next() => match frame {
                    Ok(Some(envelope)) => self.handle(&mut writer, envelope, register_correlation).await,
                    Ok(None) => Err(LinkError::Closed),
                    Err(FrameError::Io(error)) => Err(LinkError::Io(error)),
                    Err(error) => {
                        tracing::warn!(station_id = %self.config.station_id, error = %error, "dropping corrupt frame");
                        Ok(())
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Disconnect::Shutdown;
                    }
                    Ok(())
                }
            };
            if let Err(error) = result {
                return Disconnect::Lost(error);
            }
        }
    }

    async fn send_heartbeat<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<(), LinkError> {
        let status = match self.engine.status().await {
            Ok(status) => status,
            Err(_) => return Err(LinkError::Closed),
        };
        let heartbeat = Envelope::new(self.config.station_id.clone(), ControlMessage::Heartbeat { status });
        write_envelope(writer, &heartbeat).await?;
        Ok(())
    }

    async fn send_report<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        envelope: Envelope,
    ) -> Result<(), LinkError> {
        let envelope = envelope.with_correlation(self.correlation());
        self.unacked.insert(envelope.correlation, envelope.clone());
        write_envelope(writer, &envelope).await?;
        Ok(())
    }

    async fn handle<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        envelope: Envelope,
        register_correlation: u64,
    ) -> Result<(), LinkError> {
        let station_id = self.config.station_id.clone();
        let outcome = match &envelope.message {
            ControlMessage::Ack => {
                if envelope.correlation == register_correlation {
                    tracing::info!(station_id = %station_id, "registration accepted");
                }
                self.unacked.remove(&envelope.correlation);
                return Ok(());
            }
            ControlMessage::Nack { reason } => {
                if envelope.correlation == register_correlation {
                    return Err(LinkError::Rejected(reason.clone()));
                }
                tracing::warn!(station_id = %station_id, correlation = envelope.correlation, reason = %reason, "report refused");
                self.unacked.remove(&envelope.correlation);
                return Ok(());
            }
            ControlMessage::StartSession { session_id, kwh } => {
                self.engine.start(*session_id, *kwh).await
            }
            ControlMessage::Stop => self.engine.stop().await,
            ControlMessage::Resume => self.engine.resume().await,
            ControlMessage::EndSession { session_id } => self.engine.finish(*session_id).await,
            ControlMessage::Disconnect => {
                tracing::info!(station_id = %station_id, "coordinator is shutting down");
                self.engine.disconnect().await.ok();
                return Err(LinkError::Closed);
            }
            other => {
                tracing::warn!(station_id = %station_id, kind = other.name(), "unexpected message from coordinator");
                return Ok(());
            }
        };

        let reply = match outcome {
            Ok(()) => ControlMessage::Ack,
            Err(error) => {
                tracing::warn!(station_id = %station_id, command = envelope.message.name(), error = %error, "command refused");
                ControlMessage::Nack {
                    reason: error.to_string(),
                }
            }
        };
        write_envelope(writer, &envelope.reply(reply)).await?;
        Ok(())
    }
}

/// Answers monitor probes for one engine until `shutdown` flips.
pub async fn serve_probes(
    listener: TcpListener,
    engine: EngineHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), LinkError> {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        };
        tracing::debug!(peer = %peer, "probe connection accepted");
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(error) = answer_probes(stream, engine).await {
                tracing::debug!(peer = %peer, error = %error, "probe connection ended");
            }
        });
    }
}

async fn answer_probes(stream: TcpStream, engine: EngineHandle) -> Result<(), LinkError> {
    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(reader);
    while let Some(envelope) = frames.next().await? {
        if envelope.message != ControlMessage::Probe {
            continue;
        }
        let answer = if engine.probe().await {
            ControlMessage::ProbeOk
        } else {
            ControlMessage::ProbeKo
        };
        let reply = envelope.reply(answer);
        write_envelope(&mut writer, &reply).await?;
    }
    Ok(())
}

/// Sends one request frame and waits for the first reply frame.
async fn round_trip(addr: &str, request: &Envelope) -> Result<Envelope, LinkError> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    write_envelope(&mut writer, request).await?;
    FrameReader::new(reader).next().await?.ok_or(LinkError::Closed)
}

/// Probes the engine's probe endpoint over TCP.
pub struct TcpProber {
    station_id: StationId,
    engine_addr: String,
}

impl TcpProber {
    pub fn new(station_id: impl Into<StationId>, engine_addr: impl Into<String>) -> Self {
        TcpProber {
            station_id: station_id.into(),
            engine_addr: engine_addr.into(),
        }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self) -> Result<(), ProbeError> {
        let request = Envelope::new(self.station_id.clone(), ControlMessage::Probe);
        match round_trip(&self.engine_addr, &request).await {
            Ok(reply) if reply.message == ControlMessage::ProbeOk => Ok(()),
            Ok(_) => Err(ProbeError::Ko),
            Err(error) => Err(ProbeError::Connection(error.to_string())),
        }
    }
}

/// Delivers liveness reports to the coordinator's control port.
pub struct CentralReporter {
    central_addr: String,
}

impl CentralReporter {
    pub fn new(central_addr: impl Into<String>) -> Self {
        CentralReporter {
            central_addr: central_addr.into(),
        }
    }

    async fn report(&self, station_id: &str, message: ControlMessage) -> Result<(), ReportError> {
        let request = Envelope::new(station_id, message).with_correlation(1);
        match round_trip(&self.central_addr, &request).await {
            Ok(reply) => match reply.message {
                ControlMessage::Ack => Ok(()),
                ControlMessage::Nack { reason } => Err(ReportError::Rejected(reason)),
                other => Err(ReportError::Rejected(format!("unexpected reply {}", other.name()))),
            },
            Err(error) => Err(ReportError::Unreachable(error.to_string())),
        }
    }
}

#[async_trait]
impl LivenessReporter for CentralReporter {
    async fn station_down(&self, station_id: &str) -> Result<(), ReportError> {
        self.report(station_id, ControlMessage::StationDown).await
    }

    async fn station_up(&self, station_id: &str) -> Result<(), ReportError> {
        self.report(station_id, ControlMessage::StationUp).await
    }
}
