//! Probe wire format and identifier generation.
//!
//! Probes and replies travel as plain text messages with whitespace-separated
//! fields:
//!
//! ```text
//! ping <id> <sent-ns>
//! pong <id> <sent-ns> [<composed-ns>]
//! ```
//!
//! `sent-ns` is always the original probe's timestamp in nanoseconds since the
//! Unix epoch. Replies may carry the responder's compose time as a fourth field.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;

use crate::time::{from_unix_nanos, to_unix_nanos};

/// Length of generated probe identifiers.
pub const ID_LENGTH: usize = 8;

/// The kind of a probe message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Outgoing probe, observed again as a self-echo.
    Ping,
    /// Reply composed by a responder on the far side of the bridge.
    Pong,
}

/// Error returned when a message kind cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KindError {
    #[error("Invalid message kind: {0}")]
    InvalidKind(String),
}

impl FromStr for Kind {
    type Err = KindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ping" => Ok(Kind::Ping),
            "pong" => Ok(Kind::Pong),
            _ => Err(KindError::InvalidKind(s.to_string())),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Kind::Ping => write!(f, "ping"),
            Kind::Pong => write!(f, "pong"),
        }
    }
}

/// A parsed probe or reply, as carried in a message body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    pub kind: Kind,
    pub id: String,
    /// Timestamp of the original probe.
    pub origin: DateTime<Utc>,
    /// Compose time of a reply, when the responder included it.
    pub composed: Option<DateTime<Utc>>,
}

impl WireMessage {
    /// Parses a message body.
    ///
    /// Returns `None` for anything that is not a well-formed probe or reply:
    /// fewer than three fields, an unknown kind, or a non-numeric timestamp.
    /// A malformed optional fourth field is ignored.
    pub fn parse(text: &str) -> Option<WireMessage> {
        let mut fields = text.split_whitespace();
        let kind = fields.next()?.parse::<Kind>().ok()?;
        let id = fields.next()?;
        let origin = parse_nanos(fields.next()?)?;
        let composed = match kind {
            Kind::Pong => fields.next().and_then(parse_nanos),
            Kind::Ping => None,
        };

        Some(WireMessage {
            kind,
            id: id.to_string(),
            origin: from_unix_nanos(origin),
            composed: composed.map(from_unix_nanos),
        })
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.kind, self.id, to_unix_nanos(self.origin))?;
        if let Some(composed) = self.composed {
            write!(f, " {}", to_unix_nanos(composed))?;
        }
        Ok(())
    }
}

/// Builds the text of a probe message.
pub fn format_ping(id: &str, sent: DateTime<Utc>) -> String {
    WireMessage {
        kind: Kind::Ping,
        id: id.to_string(),
        origin: sent,
        composed: None,
    }
    .to_string()
}

/// Builds the text of a reply to the probe `id` sent at `origin`.
pub fn format_pong(id: &str, origin: DateTime<Utc>, composed: DateTime<Utc>) -> String {
    WireMessage {
        kind: Kind::Pong,
        id: id.to_string(),
        origin,
        composed: Some(composed),
    }
    .to_string()
}

/// Parses a decimal or `0x`-prefixed hexadecimal integer.
fn parse_nanos(field: &str) -> Option<i64> {
    match field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => field.parse::<i64>().ok(),
    }
}

/// Generates a random identifier of [`ID_LENGTH`] lowercase ASCII letters.
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LENGTH)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}
