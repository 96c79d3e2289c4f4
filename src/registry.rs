//! Cycle-scoped registry of issued probes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{probe::generate_id, time::now};

/// A probe issued into one room during a measurement cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Probe {
    pub id: String,
    /// Name of the room the probe was issued for.
    pub room: String,
    /// Wall-clock time the probe was issued.
    pub issued_at: DateTime<Utc>,
}

/// Maps probe identifiers to the probes issued during a single cycle.
///
/// A registry is created per cycle and dropped with it; events carrying ids
/// from earlier cycles therefore never match.
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    probes: HashMap<String, Probe>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        ProbeRegistry {
            probes: HashMap::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ProbeRegistry {
            probes: HashMap::with_capacity(capacity),
        }
    }

    /// Issues a probe for `room`, stamped with the current time.
    pub fn issue(&mut self, room: &str) -> &Probe {
        self.issue_at(room, now())
    }

    /// Issues a probe for `room` with an explicit issue time.
    pub fn issue_at(&mut self, room: &str, issued_at: DateTime<Utc>) -> &Probe {
        self.issue_with(room, issued_at, generate_id)
    }

    /// Issues a probe using `next_id` as the identifier source.
    ///
    /// Identifiers already outstanding in this registry are rejected and a new
    /// one is drawn, so an existing probe is never overwritten.
    fn issue_with<F>(&mut self, room: &str, issued_at: DateTime<Utc>, mut next_id: F) -> &Probe
    where
        F: FnMut() -> String,
    {
        let mut id = next_id();
        while self.probes.contains_key(&id) {
            log::debug!("Probe id {} collides with an outstanding probe, regenerating", id);
            id = next_id();
        }

        self.probes.entry(id.clone()).or_insert(Probe {
            id,
            room: room.to_string(),
            issued_at,
        })
    }

    /// Looks up a probe by identifier.
    pub fn lookup(&self, id: &str) -> Option<&Probe> {
        self.probes.get(id)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Probe> {
        self.probes.values()
    }
}
