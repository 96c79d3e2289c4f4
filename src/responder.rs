//! Far-side ping responder.
//!
//! Answers every probe seen on a transport with a reply carrying the probe's
//! id, the original timestamp and the local compose time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    metrics::responder_metrics,
    probe::{format_pong, Kind, WireMessage},
    transport::{Envelope, EnvelopeSink, Transport, TransportError},
};

/// Capacity of the outgoing reply queue.
pub const REPLY_QUEUE_CAPACITY: usize = 64;

/// A reply waiting to be sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub destination: String,
    pub text: String,
}

/// Builds the reply to a message, if it is a well-formed probe.
pub fn compose_reply(text: &str, composed: DateTime<Utc>) -> Option<String> {
    let wire = WireMessage::parse(text.trim())?;
    if wire.kind != Kind::Ping {
        return None;
    }
    Some(format_pong(&wire.id, wire.origin, composed))
}

/// Sink that turns probes into queued replies.
pub struct Responder {
    network: String,
    replies: mpsc::Sender<Reply>,
}

impl Responder {
    pub fn new(network: impl Into<String>) -> (Responder, mpsc::Receiver<Reply>) {
        let (tx, rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);
        (
            Responder {
                network: network.into(),
                replies: tx,
            },
            rx,
        )
    }
}

impl EnvelopeSink for Responder {
    fn deliver(&self, envelope: Envelope) {
        let Some(text) = compose_reply(&envelope.text, envelope.received_at) else {
            return;
        };
        responder_metrics::record_ping_received(&self.network);
        log::debug!("Answering ping in {}", envelope.destination);

        let reply = Reply {
            destination: envelope.destination,
            text,
        };
        match self.replies.try_send(reply) {
            Ok(()) => {}
            Err(TrySendError::Full(r)) => {
                log::warn!("Reply queue full, dropping pong to {}", r.destination);
                responder_metrics::record_pong_failure(&self.network);
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Reply queue closed");
            }
        }
    }
}

/// Sends queued replies until the queue closes.
pub async fn send_replies(transport: Arc<dyn Transport>, mut replies: mpsc::Receiver<Reply>) {
    while let Some(reply) = replies.recv().await {
        match transport.send(&reply.destination, &reply.text).await {
            Ok(()) => responder_metrics::record_pong_sent(transport.name()),
            Err(e) => {
                log::error!("Error sending response to {}: {}", reply.destination, e);
                responder_metrics::record_pong_failure(transport.name());
            }
        }
    }
}

/// Runs a responder on `transport` until the transport stops.
pub async fn run_responder(transport: Arc<dyn Transport>) -> Result<(), TransportError> {
    let (responder, replies) = Responder::new(transport.name());
    let sender = tokio::spawn(send_replies(transport.clone(), replies));

    log::info!("Ping responder running on {}", transport.name());
    let result = transport.listen(Arc::new(responder)).await;

    sender.abort();
    result
}
