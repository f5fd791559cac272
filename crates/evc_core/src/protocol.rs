//! Control-channel messages and their wire framing.
//!
//! A frame is `<STX><json envelope><ETX><LRC>`, where the LRC is the XOR of
//! every byte from STX through ETX. JSON never carries raw control bytes, so
//! STX/ETX cannot appear inside the payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bus::{Event, EventPayload, Origin, Topic};
use crate::{Location, StationId, StationStatus};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ControlMessage {
    Register {
        location: Location,
        price_per_kwh: f64,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    Heartbeat {
        status: StationStatus,
    },
    StartSession {
        session_id: uuid::Uuid,
        kwh: f64,
    },
    Stop,
    Resume,
    EndSession {
        session_id: uuid::Uuid,
    },
    Disconnect,
    Ack,
    Nack {
        reason: String,
    },
    Telemetry {
        session_id: uuid::Uuid,
        kwh_delivered: f64,
        seq: u64,
        epoch: u64,
    },
    SessionComplete {
        session_id: uuid::Uuid,
        final_kwh: f64,
        seq: u64,
        epoch: u64,
    },
    Fault {
        reason: String,
        seq: u64,
        epoch: u64,
    },
    Probe,
    ProbeOk,
    ProbeKo,
    StationDown,
    StationUp,
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Register { .. } => "REGISTER",
            ControlMessage::Heartbeat { .. } => "HEARTBEAT",
            ControlMessage::StartSession { .. } => "START_SESSION",
            ControlMessage::Stop => "STOP",
            ControlMessage::Resume => "RESUME",
            ControlMessage::EndSession { .. } => "END_SESSION",
            ControlMessage::Disconnect => "DISCONNECT",
            ControlMessage::Ack => "ACK",
            ControlMessage::Nack { .. } => "NACK",
            ControlMessage::Telemetry { .. } => "TELEMETRY",
            ControlMessage::SessionComplete { .. } => "SESSION_COMPLETE",
            ControlMessage::Fault { .. } => "FAULT",
            ControlMessage::Probe => "PROBE",
            ControlMessage::ProbeOk => "PROBE_OK",
            ControlMessage::ProbeKo => "PROBE_KO",
            ControlMessage::StationDown => "STATION_DOWN",
            ControlMessage::StationUp => "STATION_UP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub station_id: StationId,
    pub timestamp: DateTime<Utc>,
    /// Shared by a command and its ACK/NACK; 0 for unsolicited messages.
    #[serde(default)]
    pub correlation: u64,
    pub message: ControlMessage,
}

impl Envelope {
    pub fn new(station_id: impl Into<StationId>, message: ControlMessage) -> Self {
        Envelope {
            station_id: station_id.into(),
            timestamp: Utc::now(),
            correlation: 0,
            message,
        }
    }

    pub fn with_correlation(mut self, correlation: u64) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn reply(&self, message: ControlMessage) -> Envelope {
        Envelope::new(self.station_id.clone(), message).with_correlation(self.correlation)
    }

    /// Wraps an engine report for the uplink. Coordinator events have no
    /// wire form and yield `None`.
    pub fn from_engine_event(event: &Event) -> Option<Envelope> {
        let message = match &event.payload {
            EventPayload::Telemetry {
                session_id,
                kwh_delivered,
            } => ControlMessage::Telemetry {
                session_id: *session_id,
                kwh_delivered: *kwh_delivered,
                seq: event.seq,
                epoch: event.epoch,
            },
            EventPayload::SessionFinished {
                session_id,
                final_kwh,
            } => ControlMessage::SessionComplete {
                session_id: *session_id,
                final_kwh: *final_kwh,
                seq: event.seq,
                epoch: event.epoch,
            },
            EventPayload::Fault { reason } => ControlMessage::Fault {
                reason: reason.clone(),
                seq: event.seq,
                epoch: event.epoch,
            },
            _ => return None,
        };
        Some(Envelope {
            station_id: event.key.clone(),
            timestamp: event.timestamp,
            correlation: 0,
            message,
        })
    }

    /// Rebuilds the engine event carried by a TELEMETRY, SESSION_COMPLETE or
    /// FAULT frame.
    pub fn into_engine_event(self) -> Option<Event> {
        let (payload, seq, epoch) = match self.message {
            ControlMessage::Telemetry {
                session_id,
                kwh_delivered,
                seq,
                epoch,
            } => (
                EventPayload::Telemetry {
                    session_id,
                    kwh_delivered,
                },
                seq,
                epoch,
            ),
            ControlMessage::SessionComplete {
                session_id,
                final_kwh,
                seq,
                epoch,
            } => (
                EventPayload::SessionFinished {
                    session_id,
                    final_kwh,
                },
                seq,
                epoch,
            ),
            ControlMessage::Fault { reason, seq, epoch } => {
                (EventPayload::Fault { reason }, seq, epoch)
            }
            _ => return None,
        };
        let topic: Topic = payload.topic();
        Some(Event {
            topic,
            key: self.station_id,
            origin: Origin::Engine,
            epoch,
            seq,
            timestamp: self.timestamp,
            payload,
        })
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },
    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    Oversized,
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("invalid frame payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, byte| acc ^ byte)
}

pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() + 3 > MAX_FRAME_LEN {
        return Err(FrameError::Oversized);
    }
    let mut frame = Vec::with_capacity(body.len() + 3);
    frame.push(STX);
    frame.extend_from_slice(&body);
    frame.push(ETX);
    frame.push(lrc(&frame));
    Ok(frame)
}

/// Decodes exactly one complete frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Envelope, FrameError> {
    let mut decoder = FrameDecoder::new();
    decoder.extend(bytes);
    match decoder.next_frame() {
        Some(result) => result,
        None => Err(FrameError::Malformed("incomplete frame")),
    }
}

/// Incremental decoder for a byte stream carrying back-to-back frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next frame, `None` when more bytes are needed. Bytes before
    /// an STX are discarded; a corrupt frame is consumed and reported.
    pub fn next_frame(&mut self) -> Option<Result<Envelope, FrameError>> {
        let start = match self.buffer.iter().position(|&byte| byte == STX) {
            Some(start) => start,
            None => {
                self.buffer.clear();
                return None;
            }
        };
        self.buffer.drain(..start);

        let Some(etx) = self.buffer.iter().position(|&byte| byte == ETX) else {
            if self.buffer.len() > MAX_FRAME_LEN {
                self.buffer.clear();
                return Some(Err(FrameError::Oversized));
            }
            return None;
        };
        // STX..=ETX plus the LRC byte
        if self.buffer.len() < etx + 2 {
            return None;
        }

        let frame: Vec<u8> = self.buffer.drain(..etx + 2).collect();
        let expected = lrc(&frame[..=etx]);
        let actual = frame[etx + 1];
        if expected != actual {
            return Some(Err(FrameError::Checksum { expected, actual }));
        }

        Some(serde_json::from_slice(&frame[1..etx]).map_err(FrameError::from))
    }
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads envelopes off an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        FrameReader {
            reader,
            decoder: FrameDecoder::new(),
            chunk: vec![0; 4096],
        }
    }

    /// `Ok(None)` when the peer closed the connection. Corrupt frames are
    /// returned as errors and the reader stays usable.
    pub async fn next(&mut self) -> Result<Option<Envelope>, FrameError> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return frame.map(Some);
            }
            let read = self.reader.read(&mut self.chunk).await?;
            if read == 0 {
                return Ok(None);
            }
            self.decoder.extend(&self.chunk[..read]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn start(kwh: f64) -> Envelope {
        Envelope::new(
            "CP-001",
            ControlMessage::StartSession {
                session_id: uuid::Uuid::new_v4(),
                kwh,
            },
        )
        .with_correlation(7)
    }

    #[test]
    fn lrc_is_xor_of_all_bytes() {
        assert_eq!(lrc(&[]), 0);
        assert_eq!(lrc(&[0x02, 0x41, 0x03]), 0x02 ^ 0x41 ^ 0x03);
    }

    #[test]
    fn frame_layout_has_stx_etx_and_checksum() {
        let frame = encode_frame(&start(15.0)).unwrap();
        assert_eq!(frame[0], STX);
        assert_eq!(frame[frame.len() - 2], ETX);
        assert_eq!(frame[frame.len() - 1], lrc(&frame[..frame.len() - 1]));
    }

    #[test]
    fn message_kinds_use_wire_names() {
        let json = serde_json::to_value(&start(15.0)).unwrap();
        assert_eq!(json["message"]["kind"], "START_SESSION");
        assert_eq!(json["message"]["kwh"], 15.0);
        assert_eq!(json["stationId"], "CP-001");

        let probe = serde_json::to_value(Envelope::new("CP-001", ControlMessage::ProbeOk)).unwrap();
        assert_eq!(probe["message"]["kind"], "PROBE_OK");
        assert_eq!(ControlMessage::ProbeOk.name(), "PROBE_OK");
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let mut frame = encode_frame(&start(15.0)).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn decoder_skips_garbage_and_splits_frames() {
        let first = start(10.0);
        let second = Envelope::new("CP-001", ControlMessage::Stop);
        let mut stream = b"noise".to_vec();
        stream.extend(encode_frame(&first).unwrap());
        stream.extend(encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        let (head, tail) = stream.split_at(12);
        decoder.extend(head);
        assert!(decoder.next_frame().is_none());
        decoder.extend(tail);

        assert_eq!(decoder.next_frame().unwrap().unwrap(), first);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), second);
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn decoder_recovers_after_a_bad_frame() {
        let mut bad = encode_frame(&start(1.0)).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        let good = Envelope::new("CP-002", ControlMessage::Resume);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bad);
        decoder.extend(&encode_frame(&good).unwrap());
        assert!(decoder.next_frame().unwrap().is_err());
        assert_eq!(decoder.next_frame().unwrap().unwrap(), good);
    }

    #[test]
    fn engine_events_cross_the_wire() {
        let event = Event {
            topic: Topic::Session,
            key: "CP-001".into(),
            origin: Origin::Engine,
            epoch: 99,
            seq: 4,
            timestamp: Utc::now(),
            payload: EventPayload::Telemetry {
                session_id: uuid::Uuid::new_v4(),
                kwh_delivered: 3.5,
            },
        };
        let envelope = Envelope::from_engine_event(&event).unwrap();
        assert_eq!(envelope.message.name(), "TELEMETRY");
        assert_eq!(envelope.into_engine_event().unwrap(), event);

        let coordinator_event = Event {
            payload: EventPayload::StationStopped,
            topic: Topic::Station,
            ..event
        };
        assert!(Envelope::from_engine_event(&coordinator_event).is_none());
    }

    #[tokio::test]
    async fn frame_reader_reads_written_envelopes() {
        let (mut client, server) = tokio::io::duplex(64);
        let sent = vec![
            Envelope::new("CP-001", ControlMessage::Heartbeat {
                status: StationStatus::Activated,
            }),
            Envelope::new("CP-001", ControlMessage::StationDown),
        ];
        let to_send = sent.clone();
        let writer = tokio::spawn(async move {
            for envelope in &to_send {
                write_envelope(&mut client, envelope).await.unwrap();
            }
        });

        let mut reader = FrameReader::new(server);
        let mut received = Vec::new();
        while let Some(envelope) = reader.next().await.unwrap() {
            received.push(envelope);
        }
        writer.await.unwrap();
        assert_eq!(received, sent);
    }

    proptest! {
        #[test]
        fn any_start_command_survives_framing(
            kwh in 0.0f64..1000.0,
            correlation in any::<u64>(),
            station in "[A-Z]{2}-[0-9]{3}",
        ) {
            let envelope = Envelope::new(
                station,
                ControlMessage::StartSession { session_id: uuid::Uuid::new_v4(), kwh },
            )
            .with_correlation(correlation);
            let frame = encode_frame(&envelope).unwrap();
            prop_assert_eq!(decode_frame(&frame).unwrap(), envelope);
        }

        #[test]
        fn any_single_byte_corruption_is_detected(index in 0usize..64, flip in 1u8..=255) {
            let frame = encode_frame(&Envelope::new("CP-001", ControlMessage::Probe)).unwrap();
            let index = index % frame.len();
            let mut corrupted = frame.clone();
            corrupted[index] ^= flip;
            prop_assert!(decode_frame(&corrupted).is_err());
        }
    }
}
