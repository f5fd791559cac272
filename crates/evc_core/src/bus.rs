//! Event bus contract.
//!
//! Delivery is at-least-once and ordered only within a partition key (the
//! station id). Every event carries the publisher's epoch and a sequence
//! number per station, shared by both topics, so consumers can drop
//! duplicates with a [`SequenceTracker`] and notice gaps. Consumers that
//! need a station's events in order across topics use
//! [`EventBus::subscribe_all`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{Location, StationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Station,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Engine,
    Coordinator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventPayload {
    StationRegistered {
        location: Location,
        price_per_kwh: f64,
    },
    StationActivated,
    StationStopped,
    StationResumed,
    StationDisconnected,
    StationRecovered,
    StationError {
        reason: String,
    },
    StationUnregistered,
    /// Reported by an engine: unrecoverable simulation fault.
    Fault {
        reason: String,
    },
    SessionStarted {
        session_id: uuid::Uuid,
        driver_id: String,
        kwh_requested: f64,
    },
    /// Reported by an engine while delivering.
    Telemetry {
        session_id: uuid::Uuid,
        kwh_delivered: f64,
    },
    /// Reported by an engine when the target is reached or the driver unplugs.
    SessionFinished {
        session_id: uuid::Uuid,
        final_kwh: f64,
    },
    SessionCompleted {
        session_id: uuid::Uuid,
        kwh_delivered: f64,
        cost: f64,
    },
    SessionCancelled {
        session_id: uuid::Uuid,
        kwh_delivered: f64,
        cost: f64,
    },
    SessionFailed {
        session_id: uuid::Uuid,
        kwh_delivered: f64,
        reason: String,
    },
}

impl EventPayload {
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::StationRegistered { .. }
            | EventPayload::StationActivated
            | EventPayload::StationStopped
            | EventPayload::StationResumed
            | EventPayload::StationDisconnected
            | EventPayload::StationRecovered
            | EventPayload::StationError { .. }
            | EventPayload::StationUnregistered
            | EventPayload::Fault { .. } => Topic::Station,
            EventPayload::SessionStarted { .. }
            | EventPayload::Telemetry { .. }
            | EventPayload::SessionFinished { .. }
            | EventPayload::SessionCompleted { .. }
            | EventPayload::SessionCancelled { .. }
            | EventPayload::SessionFailed { .. } => Topic::Session,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub topic: Topic,
    /// Partition key: the station id.
    pub key: StationId,
    pub origin: Origin,
    pub epoch: u64,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("event bus closed")]
    Closed,
    #[error("uplink unavailable: {0}")]
    Uplink(String),
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: Event) -> Result<(), BusError>;
}

pub trait EventBus: EventPublisher {
    fn subscribe(&self, topic: Topic) -> Subscription;

    /// Both topics interleaved in publish order.
    fn subscribe_all(&self) -> Subscription;
}

/// A lazy, non-restartable stream of events, optionally narrowed to one
/// topic.
pub struct Subscription {
    topic: Option<Topic>,
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    pub fn topic(&self) -> Option<Topic> {
        self.topic
    }

    /// Waits for the next event; `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.topic.is_none_or(|topic| topic == event.topic) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = ?self.topic, skipped, "subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process fan-out over a single broadcast channel, so one station's
/// events keep their order across topics.
pub struct InProcessBus {
    events: broadcast::Sender<Event>,
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        InProcessBus { events }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        InProcessBus::new(1024)
    }
}

impl EventPublisher for InProcessBus {
    fn publish(&self, event: Event) -> Result<(), BusError> {
        // no subscriber yet is not an error
        let _ = self.events.send(event);
        Ok(())
    }
}

impl EventBus for InProcessBus {
    fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription {
            topic: Some(topic),
            receiver: self.events.subscribe(),
        }
    }

    fn subscribe_all(&self) -> Subscription {
        Subscription {
            topic: None,
            receiver: self.events.subscribe(),
        }
    }
}

/// Stamps events with origin, epoch and per-station sequence numbers.
pub struct Publisher {
    bus: Arc<dyn EventPublisher>,
    origin: Origin,
    epoch: u64,
    sequences: Mutex<HashMap<StationId, u64>>,
}

impl Publisher {
    pub fn new(bus: Arc<dyn EventPublisher>, origin: Origin) -> Self {
        let epoch = Utc::now().timestamp_millis().max(0) as u64;
        Self::with_epoch(bus, origin, epoch)
    }

    pub fn with_epoch(bus: Arc<dyn EventPublisher>, origin: Origin, epoch: u64) -> Self {
        Publisher {
            bus,
            origin,
            epoch,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Publishes `payload` for `key`. Failures are logged, never propagated.
    ///
    /// The sequence lock is held across the publish, so a station's events
    /// reach the bus in sequence order.
    pub fn emit(&self, key: &str, payload: EventPayload) -> Event {
        let mut sequences = self
            .sequences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let seq = sequences.entry(key.to_string()).or_insert(0);
        *seq += 1;

        let topic = payload.topic();
        let event = Event {
            topic,
            key: key.to_string(),
            origin: self.origin,
            epoch: self.epoch,
            seq: *seq,
            timestamp: Utc::now(),
            payload,
        };
        if let Err(error) = self.bus.publish(event.clone()) {
            tracing::warn!(station_id = key, topic = ?topic, error = %error, "event publish failed");
        }
        event
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Fresh,
    Duplicate,
    Gap { missing: u64 },
}

impl Delivery {
    pub fn should_apply(&self) -> bool {
        !matches!(self, Delivery::Duplicate)
    }
}

#[derive(Debug, Default)]
pub struct SequenceTracker {
    // (epoch, last seq) per publisher and station
    last: HashMap<(Origin, StationId), (u64, u64)>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &Event) -> Delivery {
        let stream = (event.origin, event.key.clone());
        let Some(&(epoch, last)) = self.last.get(&stream) else {
            self.last.insert(stream, (event.epoch, event.seq));
            return Delivery::Fresh;
        };

        if event.epoch < epoch {
            return Delivery::Duplicate;
        }
        if event.epoch > epoch {
            self.last.insert(stream, (event.epoch, event.seq));
            return Delivery::Fresh;
        }
        if event.seq <= last {
            return Delivery::Duplicate;
        }

        self.last.insert(stream, (epoch, event.seq));
        if event.seq == last + 1 {
            Delivery::Fresh
        } else {
            Delivery::Gap {
                missing: event.seq - last - 1,
            }
        }
    }
}
