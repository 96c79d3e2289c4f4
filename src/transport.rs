//! Transport abstraction and the ingestion path feeding the collector.
//!
//! A transport can send text to a destination and runs a long-lived listen
//! loop that hands every inbound message to an [`EnvelopeSink`]. Sinks are
//! synchronous and must never block, so a stalled consumer cannot stall
//! delivery for unrelated traffic.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    delay::Message,
    metrics::exporter_metrics,
    probe::{Kind, WireMessage},
};

/// Minimum capacity of each event queue.
pub const MIN_QUEUE_CAPACITY: usize = 25;

/// Errors reported by transports.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Establishing or keeping the connection failed.
    #[error("Connection error: {0}")]
    Connection(String),
    /// Sending a message failed.
    #[error("Failed to send to {destination}: {reason}")]
    Send { destination: String, reason: String },
    /// The destination is not known to the transport.
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),
    /// The transport was shut down.
    #[error("Transport closed")]
    Closed,
}

/// A message delivered by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Where the message was received, in the transport's naming.
    pub destination: String,
    pub text: String,
    /// Timestamp stamped by the relay, if the transport exposes one.
    pub relayed_at: Option<DateTime<Utc>>,
    /// Local arrival time.
    pub received_at: DateTime<Utc>,
}

/// Consumer of inbound messages.
pub trait EnvelopeSink: Send + Sync {
    fn deliver(&self, envelope: Envelope);
}

/// A messaging network the exporter or responder talks to.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Sends `text` to `destination`.
    async fn send(&self, destination: &str, text: &str) -> Result<(), TransportError>;

    /// Runs the ingestion loop, delivering inbound messages to `sink`.
    ///
    /// Returns only when the transport fails permanently or is closed.
    async fn listen(&self, sink: Arc<dyn EnvelopeSink>) -> Result<(), TransportError>;
}

/// A configured room: the name used in metrics and the transport destination.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Room {
    pub name: String,
    pub destination: String,
}

impl Room {
    pub fn new(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Room {
            name: name.into(),
            destination: destination.into(),
        }
    }
}

/// Receiving ends of the self-echo and reply queues.
#[derive(Debug)]
pub struct EventStreams {
    pub pings: mpsc::Receiver<Message>,
    pub pongs: mpsc::Receiver<Message>,
}

/// Sink that classifies probe traffic into the self-echo and reply queues.
///
/// Envelopes are translated from transport destinations to room names; traffic
/// from unknown destinations and malformed bodies are dropped here.
pub struct ProbeInbox {
    rooms: Vec<Room>,
    pings: mpsc::Sender<Message>,
    pongs: mpsc::Sender<Message>,
}

impl ProbeInbox {
    /// Creates the inbox and the matching streams for `rooms`.
    pub fn new(rooms: &[Room]) -> (ProbeInbox, EventStreams) {
        let capacity = queue_capacity(rooms.len());
        let (ping_tx, ping_rx) = mpsc::channel(capacity);
        let (pong_tx, pong_rx) = mpsc::channel(capacity);

        (
            ProbeInbox {
                rooms: rooms.to_vec(),
                pings: ping_tx,
                pongs: pong_tx,
            },
            EventStreams {
                pings: ping_rx,
                pongs: pong_rx,
            },
        )
    }

    fn room_name(&self, destination: &str) -> Option<&str> {
        self.rooms
            .iter()
            .find(|r| r.destination == destination)
            .map(|r| r.name.as_str())
    }
}

impl EnvelopeSink for ProbeInbox {
    fn deliver(&self, envelope: Envelope) {
        let Some(room) = self.room_name(&envelope.destination) else {
            log::debug!("Ignoring message from unconfigured room {}", envelope.destination);
            return;
        };

        let Some(wire) = WireMessage::parse(&envelope.text) else {
            log::debug!("Ignoring non-probe message in {}", room);
            exporter_metrics::record_message_discarded("malformed");
            return;
        };

        let kind = wire.kind;
        let message = Message::from_wire(wire, room, envelope.relayed_at, envelope.received_at);
        let queue = match kind {
            Kind::Ping => &self.pings,
            Kind::Pong => &self.pongs,
        };

        match queue.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                log::warn!("Event queue full, dropping {} {} from {}", kind, msg.id, room);
                exporter_metrics::record_queue_drop();
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Event queue closed, dropping {} from {}", kind, room);
            }
        }
    }
}

/// Queue capacity for `rooms` configured rooms.
pub fn queue_capacity(rooms: usize) -> usize {
    MIN_QUEUE_CAPACITY.max(rooms.saturating_mul(4))
}
