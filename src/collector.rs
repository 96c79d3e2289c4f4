//! Response collection for one measurement cycle.
//!
//! The collector is the single consumer of the self-echo and reply queues. It
//! matches every event to a probe through the cycle's registry and stops as
//! soon as every room is resolved, or when the shared deadline fires.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::{
    delay::{Delay, Message},
    metrics::exporter_metrics,
    registry::ProbeRegistry,
    transport::{EventStreams, Room},
};

/// Outcome of one measurement cycle.
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    /// One entry per configured room, keyed by room name.
    pub delays: BTreeMap<String, Delay>,
    /// The deadline fired before every room was resolved.
    pub timed_out: bool,
    /// Duration of the cycle. [`collect`] measures its own wait;
    /// [`crate::exporter::Exporter::run_cycle`] covers sending as well.
    pub elapsed: Duration,
}

impl CycleReport {
    /// Rooms that did not receive both events.
    pub fn unresolved(&self) -> impl Iterator<Item = &str> {
        self.delays
            .iter()
            .filter(|(_, d)| !d.is_complete())
            .map(|(name, _)| name.as_str())
    }
}

/// Collects self-echoes and replies until every room is complete or `deadline`
/// is reached.
///
/// Events whose id is not in `registry` are discarded without touching any
/// delay. Events are filed under the room the probe was issued for, not the
/// room the event arrived in. A reply is only recorded once the self-echo of
/// the same probe has been seen; replies arriving first are held until the
/// echo shows up and dropped at the end of the cycle otherwise.
pub async fn collect(
    streams: &mut EventStreams,
    registry: &ProbeRegistry,
    rooms: &[Room],
    deadline: Instant,
) -> CycleReport {
    let started = Instant::now();
    log::debug!(
        "Waiting for replies, timeout in {:?}",
        deadline.saturating_duration_since(started)
    );

    let mut delays: BTreeMap<String, Delay> = rooms
        .iter()
        .map(|r| (r.name.clone(), Delay::default()))
        .collect();
    let mut early_pongs: HashMap<String, Message> = HashMap::new();
    let mut pending = delays.len() * 2;

    let mut pings_open = true;
    let mut pongs_open = true;

    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    let mut timed_out = false;

    while pending > 0 {
        if !pings_open && !pongs_open {
            log::warn!("Event streams closed, ending cycle early");
            break;
        }

        tokio::select! {
            msg = streams.pings.recv(), if pings_open => {
                let Some(mut msg) = msg else {
                    pings_open = false;
                    continue;
                };

                let Some(probe) = registry.lookup(&msg.id) else {
                    log::debug!("Ignoring ping with ID {}", msg.id);
                    exporter_metrics::record_message_discarded("unknown_id");
                    continue;
                };
                let Some(delay) = delays.get_mut(&probe.room) else {
                    continue;
                };
                if delay.ping.is_some() {
                    log::debug!("Ignoring duplicate ping with ID {}", msg.id);
                    exporter_metrics::record_message_discarded("duplicate");
                    continue;
                }

                msg.sent_at = Some(probe.issued_at);
                if let (Some(relayed), Some(sent)) = (msg.relayed_at, msg.sent_at) {
                    log::debug!(
                        "Received ping for {} with relay delay of {}ms",
                        probe.room,
                        (relayed - sent).num_milliseconds()
                    );
                }
                delay.ping = Some(msg);
                pending -= 1;

                if let Some(pong) = early_pongs.remove(&probe.id) {
                    delay.pong = Some(pong);
                    pending -= 1;
                }
            }

            msg = streams.pongs.recv(), if pongs_open => {
                let Some(msg) = msg else {
                    pongs_open = false;
                    continue;
                };

                let Some(probe) = registry.lookup(&msg.id) else {
                    log::debug!("Ignoring pong with ID {}", msg.id);
                    exporter_metrics::record_message_discarded("unknown_id");
                    continue;
                };
                let Some(delay) = delays.get_mut(&probe.room) else {
                    continue;
                };
                if delay.pong.is_some() || early_pongs.contains_key(&probe.id) {
                    log::debug!("Ignoring duplicate pong with ID {}", msg.id);
                    exporter_metrics::record_message_discarded("duplicate");
                    continue;
                }

                if msg.room != probe.room {
                    log::debug!(
                        "Pong with ID {} arrived in {}, filing under {}",
                        msg.id,
                        msg.room,
                        probe.room
                    );
                }

                match delay.ping.as_ref() {
                    Some(ping) => {
                        log::debug!(
                            "Received response for {} with RTT of {}ms",
                            probe.room,
                            (msg.received_at - ping.sent_at.unwrap_or(probe.issued_at))
                                .num_milliseconds()
                        );
                        delay.pong = Some(msg);
                        pending -= 1;
                    }
                    None => {
                        log::debug!("Holding pong with ID {} until its ping arrives", msg.id);
                        early_pongs.insert(probe.id.clone(), msg);
                    }
                }
            }

            _ = &mut sleep => {
                log::info!("Timed out waiting for replies.");
                timed_out = true;
                break;
            }
        }
    }

    if !early_pongs.is_empty() {
        log::debug!("Dropping {} pongs without a matching ping", early_pongs.len());
        for _ in early_pongs.drain() {
            exporter_metrics::record_message_discarded("missing_ping");
        }
    }

    CycleReport {
        delays,
        timed_out,
        elapsed: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        probe::{Kind, WireMessage},
        time::{from_unix_nanos, now},
        transport::{Envelope, EnvelopeSink, ProbeInbox},
    };
    use chrono::TimeDelta;

    fn rooms(names: &[&str]) -> Vec<Room> {
        names
            .iter()
            .map(|n| Room::new(*n, format!("!{}:example.org", n)))
            .collect()
    }

    fn issue(registry: &mut ProbeRegistry, room: &str) -> String {
        registry.issue(room).id.clone()
    }

    fn message(kind: Kind, id: &str, room: &str) -> Message {
        let text = match kind {
            Kind::Ping => format!("ping {} 1000", id),
            Kind::Pong => format!("pong {} 1000 2000", id),
        };
        Message::from_wire(
            WireMessage::parse(&text).unwrap(),
            room,
            Some(now()),
            now(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_before_deadline() {
        let rooms = rooms(&["a", "b"]);
        let (inbox, mut streams) = ProbeInbox::new(&rooms);
        let mut registry = ProbeRegistry::new();
        let a = issue(&mut registry, "a");
        let b = issue(&mut registry, "b");

        let inbox = std::sync::Arc::new(inbox);
        for (id, dest, delay_ms) in [(a, "!a:example.org", 50u64), (b, "!b:example.org", 80)] {
            let inbox = inbox.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                inbox.deliver(Envelope {
                    destination: dest.to_string(),
                    text: format!("ping {} 1000", id),
                    relayed_at: Some(now()),
                    received_at: now(),
                });
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                inbox.deliver(Envelope {
                    destination: dest.to_string(),
                    text: format!("pong {} 1000 2000", id),
                    relayed_at: Some(now()),
                    received_at: now(),
                });
            });
        }

        let start = Instant::now();
        let report = collect(&mut streams, &registry, &rooms, start + Duration::from_secs(2)).await;

        assert!(!report.timed_out);
        assert!(report.delays.values().all(Delay::is_complete));
        // Bounded by the slowest room, not the sum of all rooms
        assert_eq!(start.elapsed(), Duration::from_millis(160));
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_rooms_one_silent() {
        let rooms = rooms(&["a", "b", "c"]);
        let (inbox, mut streams) = ProbeInbox::new(&rooms);
        let mut registry = ProbeRegistry::new();
        let a = issue(&mut registry, "a");
        let b = issue(&mut registry, "b");
        issue(&mut registry, "c");

        let inbox = std::sync::Arc::new(inbox);
        let base = now();
        for (id, dest) in [(a, "!a:example.org"), (b, "!b:example.org")] {
            let inbox = inbox.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                inbox.deliver(Envelope {
                    destination: dest.to_string(),
                    text: format!("ping {} 1000", id),
                    relayed_at: Some(base + TimeDelta::milliseconds(25)),
                    received_at: base + TimeDelta::milliseconds(50),
                });
                tokio::time::sleep(Duration::from_millis(70)).await;
                inbox.deliver(Envelope {
                    destination: dest.to_string(),
                    text: format!("pong {} 1000", id),
                    relayed_at: Some(base + TimeDelta::milliseconds(100)),
                    received_at: base + TimeDelta::milliseconds(120),
                });
            });
        }

        let start = Instant::now();
        let report = collect(&mut streams, &registry, &rooms, start + Duration::from_secs(2)).await;

        assert!(report.timed_out);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(report.unresolved().collect::<Vec<_>>(), vec!["c"]);

        for room in ["a", "b"] {
            let delay = &report.delays[room];
            assert!(delay.is_success());
            // The ping's sent time comes from the registry, not from the wire
            let sent = delay.ping.as_ref().unwrap().sent_at.unwrap();
            assert_eq!(sent, registry.iter().find(|p| p.room == room).unwrap().issued_at);
        }
        assert_eq!(report.delays["c"], Delay::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_ids_are_discarded() {
        let rooms = rooms(&["a"]);
        let (inbox, mut streams) = ProbeInbox::new(&rooms);
        let mut registry = ProbeRegistry::new();
        issue(&mut registry, "a");

        inbox.deliver(Envelope {
            destination: "!a:example.org".to_string(),
            text: "ping zzzzzzzz 1000".to_string(),
            relayed_at: None,
            received_at: now(),
        });
        inbox.deliver(Envelope {
            destination: "!a:example.org".to_string(),
            text: "pong zzzzzzzz 1000".to_string(),
            relayed_at: None,
            received_at: now(),
        });

        let deadline = Instant::now() + Duration::from_secs(1);
        let report = collect(&mut streams, &registry, &rooms, deadline).await;

        assert!(report.timed_out);
        assert_eq!(report.delays["a"], Delay::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_text_is_discarded() {
        let rooms = rooms(&["a"]);
        let (inbox, mut streams) = ProbeInbox::new(&rooms);
        let mut registry = ProbeRegistry::new();
        let id = issue(&mut registry, "a");

        inbox.deliver(Envelope {
            destination: "!a:example.org".to_string(),
            text: format!("ping {}", id),
            relayed_at: None,
            received_at: now(),
        });
        inbox.deliver(Envelope {
            destination: "!a:example.org".to_string(),
            text: "ping abc".to_string(),
            relayed_at: None,
            received_at: now(),
        });

        let deadline = Instant::now() + Duration::from_millis(500);
        let report = collect(&mut streams, &registry, &rooms, deadline).await;

        assert_eq!(report.delays["a"], Delay::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_matched_by_id_not_envelope() {
        let rooms = rooms(&["a", "b"]);
        let (inbox, mut streams) = ProbeInbox::new(&rooms);
        let mut registry = ProbeRegistry::new();
        let a = issue(&mut registry, "a");

        inbox.deliver(Envelope {
            destination: "!a:example.org".to_string(),
            text: format!("ping {} 1000", a),
            relayed_at: None,
            received_at: now(),
        });
        // Reply for room a's probe shows up in room b
        inbox.deliver(Envelope {
            destination: "!b:example.org".to_string(),
            text: format!("pong {} 1000", a),
            relayed_at: None,
            received_at: now(),
        });

        let deadline = Instant::now() + Duration::from_millis(500);
        let report = collect(&mut streams, &registry, &rooms, deadline).await;

        let delay_a = &report.delays["a"];
        assert!(delay_a.is_complete());
        assert_eq!(delay_a.pong.as_ref().unwrap().room, "b");
        assert!(report.delays["b"].pong.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_without_ping_is_not_recorded() {
        let rooms = rooms(&["a"]);
        let (_inbox, mut streams) = ProbeInbox::new(&rooms);
        let mut registry = ProbeRegistry::new();
        let a = issue(&mut registry, "a");

        let (ping_tx, ping_rx) = tokio::sync::mpsc::channel(4);
        let (pong_tx, pong_rx) = tokio::sync::mpsc::channel(4);
        streams.pings = ping_rx;
        streams.pongs = pong_rx;

        pong_tx.send(message(Kind::Pong, &a, "a")).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(300);
        let report = collect(&mut streams, &registry, &rooms, deadline).await;

        assert!(report.timed_out);
        assert!(report.delays["a"].ping.is_none());
        assert!(report.delays["a"].pong.is_none());
        drop(ping_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_before_ping_is_promoted() {
        let rooms = rooms(&["a"]);
        let mut registry = ProbeRegistry::new();
        let a = issue(&mut registry, "a");

        let (ping_tx, ping_rx) = tokio::sync::mpsc::channel(4);
        let (pong_tx, pong_rx) = tokio::sync::mpsc::channel(4);
        let mut streams = EventStreams {
            pings: ping_rx,
            pongs: pong_rx,
        };

        pong_tx.send(message(Kind::Pong, &a, "a")).await.unwrap();
        let id = a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            ping_tx.send(message(Kind::Ping, &id, "a")).await.unwrap();
        });

        let start = Instant::now();
        let report = collect(&mut streams, &registry, &rooms, start + Duration::from_secs(5)).await;

        assert!(!report.timed_out);
        assert!(report.delays["a"].is_complete());
        assert_eq!(start.elapsed(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ping_keeps_first() {
        let rooms = rooms(&["a"]);
        let mut registry = ProbeRegistry::new();
        let a = issue(&mut registry, "a");

        let (ping_tx, ping_rx) = tokio::sync::mpsc::channel(4);
        let (_pong_tx, pong_rx) = tokio::sync::mpsc::channel(4);
        let mut streams = EventStreams {
            pings: ping_rx,
            pongs: pong_rx,
        };

        let mut first = message(Kind::Ping, &a, "a");
        first.received_at = from_unix_nanos(1);
        let mut second = message(Kind::Ping, &a, "a");
        second.received_at = from_unix_nanos(2);
        ping_tx.send(first).await.unwrap();
        ping_tx.send(second).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(100);
        let report = collect(&mut streams, &registry, &rooms, deadline).await;

        let ping = report.delays["a"].ping.as_ref().unwrap();
        assert_eq!(ping.received_at, from_unix_nanos(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_cycle_events_are_ignored() {
        let rooms = rooms(&["a"]);
        let (inbox, mut streams) = ProbeInbox::new(&rooms);

        // First cycle: nothing arrives in time
        let mut first = ProbeRegistry::new();
        let stale = issue(&mut first, "a");
        let report = collect(
            &mut streams,
            &first,
            &rooms,
            Instant::now() + Duration::from_millis(100),
        )
        .await;
        assert!(report.timed_out);
        drop(first);

        // Late events from the first cycle land while the second is running
        let mut second = ProbeRegistry::new();
        let fresh = issue(&mut second, "a");
        for text in [
            format!("ping {} 1000", stale),
            format!("pong {} 1000", stale),
            format!("ping {} 1000", fresh),
            format!("pong {} 1000", fresh),
        ] {
            inbox.deliver(Envelope {
                destination: "!a:example.org".to_string(),
                text,
                relayed_at: None,
                received_at: now(),
            });
        }

        let report = collect(
            &mut streams,
            &second,
            &rooms,
            Instant::now() + Duration::from_secs(1),
        )
        .await;

        assert!(!report.timed_out);
        let delay = &report.delays["a"];
        assert_eq!(delay.ping.as_ref().unwrap().id, fresh);
        assert_eq!(delay.pong.as_ref().unwrap().id, fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_streams_end_cycle() {
        let rooms = rooms(&["a"]);
        let mut registry = ProbeRegistry::new();
        issue(&mut registry, "a");

        let (ping_tx, ping_rx) = tokio::sync::mpsc::channel::<Message>(1);
        let (pong_tx, pong_rx) = tokio::sync::mpsc::channel::<Message>(1);
        drop(ping_tx);
        drop(pong_tx);
        let mut streams = EventStreams {
            pings: ping_rx,
            pongs: pong_rx,
        };

        let start = Instant::now();
        let report = collect(&mut streams, &registry, &rooms, start + Duration::from_secs(60)).await;

        assert!(!report.timed_out);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(report.unresolved().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_room_set() {
        let (_inbox, mut streams) = ProbeInbox::new(&[]);
        let registry = ProbeRegistry::new();

        let report = collect(
            &mut streams,
            &registry,
            &[],
            Instant::now() + Duration::from_secs(1),
        )
        .await;

        assert!(!report.timed_out);
        assert!(report.delays.is_empty());
    }
}
