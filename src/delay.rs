//! Matched probe events and the latency segments derived from them.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};

use crate::probe::{Kind, WireMessage};

/// A probe or reply observed on the local transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: Kind,
    pub id: String,
    /// Room the message arrived in, as reported by the transport.
    pub room: String,
    /// For a ping, the issue time from the registry. For a pong, the time the
    /// responder composed it, when known.
    pub sent_at: Option<DateTime<Utc>>,
    /// Time stamped by the relay (homeserver) on the message.
    pub relayed_at: Option<DateTime<Utc>>,
    /// Local arrival time.
    pub received_at: DateTime<Utc>,
    /// Probe timestamp carried on the wire.
    pub origin: DateTime<Utc>,
}

impl Message {
    /// Builds a message from a parsed body and the envelope metadata.
    pub fn from_wire(
        wire: WireMessage,
        room: &str,
        relayed_at: Option<DateTime<Utc>>,
        received_at: DateTime<Utc>,
    ) -> Message {
        Message {
            kind: wire.kind,
            id: wire.id,
            room: room.to_string(),
            sent_at: wire.composed,
            relayed_at,
            received_at,
            origin: wire.origin,
        }
    }
}

/// The self-echo and reply collected for one room in one cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delay {
    pub ping: Option<Message>,
    pub pong: Option<Message>,
}

impl Delay {
    /// Both the self-echo and the reply arrived.
    pub fn is_complete(&self) -> bool {
        self.ping.is_some() && self.pong.is_some()
    }

    /// Whether a reply was received.
    pub fn is_success(&self) -> bool {
        self.pong.is_some()
    }

    pub fn segments(&self) -> Segments {
        Segments::compute(self)
    }
}

/// A named leg of the probe round trip.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// Origin to relay.
    ToRelay,
    /// Relay back to the local observer of the self-echo.
    FromRelay,
    /// Relay to the far-side responder.
    RelayToResponder,
    /// Origin to the far-side responder.
    ToResponder,
    /// Responder to relay.
    ReplyToRelay,
    /// Relay to the local observer of the reply.
    RelayToLocal,
    /// Responder to the local observer.
    ReturnLeg,
    /// Full round trip.
    Total,
}

impl Segment {
    pub const ALL: [Segment; 8] = [
        Segment::ToRelay,
        Segment::FromRelay,
        Segment::RelayToResponder,
        Segment::ToResponder,
        Segment::ReplyToRelay,
        Segment::RelayToLocal,
        Segment::ReturnLeg,
        Segment::Total,
    ];

    /// Label value identifying the segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::ToRelay => "to_relay",
            Segment::FromRelay => "from_relay",
            Segment::RelayToResponder => "relay_to_responder",
            Segment::ToResponder => "to_responder",
            Segment::ReplyToRelay => "reply_to_relay",
            Segment::RelayToLocal => "relay_to_local",
            Segment::ReturnLeg => "return_leg",
            Segment::Total => "total",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latency segments of one room. Undefined segments are `None`.
///
/// Values are signed: a negative duration means the clocks involved disagree
/// and is kept as-is so it can be reported.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Segments {
    pub to_relay: Option<TimeDelta>,
    pub from_relay: Option<TimeDelta>,
    pub relay_to_responder: Option<TimeDelta>,
    pub to_responder: Option<TimeDelta>,
    pub reply_to_relay: Option<TimeDelta>,
    pub relay_to_local: Option<TimeDelta>,
    pub return_leg: Option<TimeDelta>,
    pub total: Option<TimeDelta>,
}

impl Segments {
    pub fn compute(delay: &Delay) -> Segments {
        let mut s = Segments::default();

        let ping = delay.ping.as_ref();
        let pong = delay.pong.as_ref();
        let ping_sent = ping.and_then(|p| p.sent_at);
        let ping_relayed = ping.and_then(|p| p.relayed_at);
        let pong_sent = pong.and_then(|p| p.sent_at);
        let pong_relayed = pong.and_then(|p| p.relayed_at);

        if let Some(ping) = ping {
            s.to_relay = diff(ping_relayed, ping_sent);
            s.from_relay = diff(Some(ping.received_at), ping_relayed);
        }

        if let Some(pong) = pong {
            s.reply_to_relay = diff(pong_relayed, pong_sent);
            s.relay_to_local = diff(Some(pong.received_at), pong_relayed);
            s.return_leg = diff(Some(pong.received_at), pong_sent);

            if ping.is_some() {
                s.total = diff(Some(pong.received_at), ping_sent);
                s.relay_to_responder = diff(pong_sent, ping_relayed);
                s.to_responder = diff(pong_sent, ping_sent);
            }
        }

        s
    }

    pub fn get(&self, segment: Segment) -> Option<TimeDelta> {
        match segment {
            Segment::ToRelay => self.to_relay,
            Segment::FromRelay => self.from_relay,
            Segment::RelayToResponder => self.relay_to_responder,
            Segment::ToResponder => self.to_responder,
            Segment::ReplyToRelay => self.reply_to_relay,
            Segment::RelayToLocal => self.relay_to_local,
            Segment::ReturnLeg => self.return_leg,
            Segment::Total => self.total,
        }
    }

    /// Defined segments, in a fixed order.
    pub fn iter(&self) -> impl Iterator<Item = (Segment, TimeDelta)> + '_ {
        Segment::ALL
            .iter()
            .filter_map(move |&seg| self.get(seg).map(|d| (seg, d)))
    }

    /// Segments with a negative duration.
    pub fn anomalies(&self) -> impl Iterator<Item = (Segment, TimeDelta)> + '_ {
        self.iter().filter(|(_, d)| *d < TimeDelta::zero())
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

fn diff(later: Option<DateTime<Utc>>, earlier: Option<DateTime<Utc>>) -> Option<TimeDelta> {
    Some(later? - earlier?)
}
