//! TCP control port of the coordinator.
//!
//! Engines connect, REGISTER and keep the connection open: the coordinator
//! sends commands down it and the engine sends heartbeats and reports up it.
//! Monitors connect to deliver STATION_DOWN / STATION_UP reports.

use std::sync::Arc;

use chrono::Utc;
use evc_core::bus::EventPublisher;
use evc_core::protocol::{ControlMessage, Envelope, FrameError, FrameReader, write_envelope};
use evc_core::registry::Credentials;
use evc_core::{Location, StationId};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::control::{EngineLink, TcpControlHub};
use crate::coordinator::Coordinator;
use crate::registry_client::StationDirectory;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct CentralServer {
    coordinator: Arc<Coordinator>,
    hub: Arc<TcpControlHub>,
    bus: Arc<dyn EventPublisher>,
    directory: Option<Arc<dyn StationDirectory>>,
}

impl CentralServer {
    /// Without a `directory` every REGISTER is admitted.
    pub fn new(
        coordinator: Arc<Coordinator>,
        hub: Arc<TcpControlHub>,
        bus: Arc<dyn EventPublisher>,
        directory: Option<Arc<dyn StationDirectory>>,
    ) -> Self {
        CentralServer {
            coordinator,
            hub,
            bus,
            directory,
        }
    }

    /// Accepts connections until `shutdown` flips to `true`.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        tracing::info!(addr = ?listener.local_addr().ok(), "control port listening");
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("control port closed");
                        return Ok(());
                    }
                    continue;
                }
            };
            tracing::debug!(peer = %peer, "control connection accepted");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = server.handle_connection(stream).await {
                    tracing::debug!(peer = %peer, error = %error, "control connection ended");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), ServerError> {
        let (reader, mut writer) = stream.into_split();
        let mut frames = FrameReader::new(reader);

        let Some(first) = frames.next().await? else {
            return Ok(());
        };
        match first.message.clone() {
            ControlMessage::Register {
                location,
                price_per_kwh,
                username,
                password,
            } => {
                let registration = Registration {
                    location,
                    price_per_kwh,
                    username,
                    password,
                };
                self.serve_engine(first, registration, frames, writer).await
            }
            ControlMessage::StationDown | ControlMessage::StationUp => {
                let mut next = Some(first);
                while let Some(envelope) = next {
                    let reply = self.liveness_report(&envelope).await;
                    write_envelope(&mut writer, &envelope.reply(reply)).await?;
                    next = frames.next().await?;
                }
                Ok(())
            }
            other => {
                tracing::warn!(station_id = %first.station_id, kind = other.name(), "connection did not start with REGISTER");
                let nack = ControlMessage::Nack {
                    reason: format!("expected REGISTER, got {}", other.name()),
                };
                write_envelope(&mut writer, &first.reply(nack)).await?;
                Ok(())
            }
        }
    }

    async fn liveness_report(&self, envelope: &Envelope) -> ControlMessage {
        let station_id = envelope.station_id.as_str();
        let result = match envelope.message {
            ControlMessage::StationDown => self.coordinator.on_station_down(station_id).await.map(|_| ()),
            ControlMessage::StationUp => self.coordinator.on_station_up(station_id).await.map(|_| ()),
            _ => {
                return ControlMessage::Nack {
                    reason: format!("unexpected {} on a monitor connection", envelope.message.name()),
                };
            }
        };
        match result {
            Ok(()) => ControlMessage::Ack,
            Err(error) => {
                tracing::warn!(station_id, error = %error, "liveness report refused");
                ControlMessage::Nack {
                    reason: error.to_string(),
                }
            }
        }
    }

    async fn authenticate(&self, station_id: &str, registration: &Registration) -> Result<(), String> {
        let Some(directory) = &self.directory else {
            return Ok(());
        };
        let (Some(username), Some(password)) = (&registration.username, &registration.password) else {
            return Err("credentials required".into());
        };
        let credentials = Credentials {
            station_id: station_id.to_string(),
            username: username.clone(),
            password: password.clone(),
        };
        match directory.verify(&credentials).await {
            Ok(true) => Ok(()),
            Ok(false) => Err("invalid credentials".into()),
            Err(error) => {
                tracing::warn!(station_id, error = %error, "registry unavailable for verification");
                Err("registry unavailable".into())
            }
        }
    }

    async fn serve_engine<R, W>(
        &self,
        register: Envelope,
        registration: Registration,
        mut frames: FrameReader<R>,
        mut writer: W,
    ) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let station_id: StationId = register.station_id.clone();

        let admitted = match self.authenticate(&station_id, &registration).await {
            Ok(()) => self
                .coordinator
                .on_station_registered(&station_id, registration.location, registration.price_per_kwh)
                .await
                .map_err(|error| error.to_string()),
            Err(reason) => Err(reason),
        };
        if let Err(reason) = admitted {
            tracing::warn!(station_id = %station_id, reason = %reason, "registration refused");
            write_envelope(&mut writer, &register.reply(ControlMessage::Nack { reason })).await?;
            return Ok(());
        }

        let (outgoing, mut queued) = mpsc::channel::<Envelope>(64);
        let writer_station = station_id.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = queued.recv().await {
                if let Err(error) = write_envelope(&mut writer, &envelope).await {
                    tracing::debug!(station_id = %writer_station, error = %error, "engine writer stopped");
                    break;
                }
            }
        });

        let link = Arc::new(EngineLink::new(outgoing.clone()));
        self.hub.attach(&station_id, link.clone()).await;
        let _ = outgoing.send(register.reply(ControlMessage::Ack)).await;
        tracing::info!(station_id = %station_id, "engine connected");

        let result = self.engine_loop(&station_id, &link, &outgoing, &mut frames).await;

        self.hub.detach(&station_id, &link).await;
        link.close();
        drop(outgoing);
        drop(link);
        writer_task.abort();
        tracing::info!(station_id = %station_id, "engine disconnected");
        result
    }

    async fn engine_loop<R: AsyncRead + Unpin>(
        &self,
        station_id: &str,
        link: &EngineLink,
        outgoing: &mpsc::Sender<Envelope>,
        frames: &mut FrameReader<R>,
    ) -> Result<(), ServerError> {
        loop {
            let envelope = match frames.next().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => return Ok(()),
                Err(FrameError::Io(error)) => return Err(error.into()),
                Err(error) => {
                    tracing::warn!(station_id, error = %error, "dropping corrupt frame");
                    continue;
                }
            };
            if envelope.station_id != station_id {
                tracing::warn!(station_id, claimed = %envelope.station_id, "frame for another station ignored");
                continue;
            }

            match &envelope.message {
                ControlMessage::Heartbeat { status } => {
                    tracing::trace!(station_id, engine_status = %status, "heartbeat");
                    if let Err(error) = self.coordinator.on_heartbeat(station_id, Utc::now()).await {
                        tracing::warn!(station_id, error = %error, "heartbeat rejected");
                    }
                }
                ControlMessage::Ack | ControlMessage::Nack { .. } => {
                    TcpControlHub::resolve(link, envelope);
                }
                ControlMessage::Telemetry { .. }
                | ControlMessage::SessionComplete { .. }
                | ControlMessage::Fault { .. } => {
                    let reply_to = envelope.clone();
                    let reply = match envelope.into_engine_event() {
                        Some(event) => match self.bus.publish(event) {
                            Ok(()) => ControlMessage::Ack,
                            Err(error) => ControlMessage::Nack {
                                reason: error.to_string(),
                            },
                        },
                        None => continue,
                    };
                    let _ = outgoing.send(reply_to.reply(reply)).await;
                }
                other => {
                    tracing::warn!(station_id, kind = other.name(), "unexpected message from engine");
                }
            }
        }
    }
}

struct Registration {
    location: Location,
    price_per_kwh: f64,
    username: Option<String>,
    password: Option<String>,
}
