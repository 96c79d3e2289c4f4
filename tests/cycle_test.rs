//! End-to-end probe cycles over an in-memory bridge.
//!
//! The bridge echoes every probe back into the exporter's inbox, the way a
//! homeserver echoes our own messages, and answers pings from responsive
//! rooms the way the IRC-side responder does.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use matrix_irc_ping_exporter::{
    exporter::Exporter,
    metrics,
    responder::compose_reply,
    time::now,
    transport::{Envelope, EnvelopeSink, ProbeInbox, Room, Transport, TransportError},
};

const BROKEN_ROOM: &str = "!broken:example.org";

struct LoopbackBridge {
    inbox: Arc<dyn EnvelopeSink>,
    responsive: HashSet<String>,
    sent: Mutex<Vec<(String, String)>>,
    send_delay: Duration,
}

#[async_trait]
impl Transport for LoopbackBridge {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn send(&self, destination: &str, text: &str) -> Result<(), TransportError> {
        tokio::time::sleep(self.send_delay).await;
        if destination == BROKEN_ROOM {
            return Err(TransportError::Send {
                destination: destination.to_string(),
                reason: "forbidden".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), text.to_string()));

        self.inbox.deliver(Envelope {
            destination: destination.to_string(),
            text: text.to_string(),
            relayed_at: Some(now()),
            received_at: now(),
        });

        if self.responsive.contains(destination) {
            if let Some(reply) = compose_reply(text, now()) {
                self.inbox.deliver(Envelope {
                    destination: destination.to_string(),
                    text: reply,
                    relayed_at: Some(now()),
                    received_at: now(),
                });
            }
        }
        Ok(())
    }

    async fn listen(&self, _sink: Arc<dyn EnvelopeSink>) -> Result<(), TransportError> {
        std::future::pending().await
    }
}

fn setup(rooms: Vec<Room>, responsive: &[&str], timeout: Duration) -> (Arc<Exporter>, Arc<LoopbackBridge>) {
    setup_with_delay(rooms, responsive, timeout, Duration::ZERO)
}

fn setup_with_delay(
    rooms: Vec<Room>,
    responsive: &[&str],
    timeout: Duration,
    send_delay: Duration,
) -> (Arc<Exporter>, Arc<LoopbackBridge>) {
    let (inbox, streams) = ProbeInbox::new(&rooms);
    let bridge = Arc::new(LoopbackBridge {
        inbox: Arc::new(inbox),
        responsive: responsive.iter().map(|r| r.to_string()).collect(),
        sent: Mutex::new(Vec::new()),
        send_delay,
    });
    let exporter = Arc::new(Exporter::new(bridge.clone(), rooms, timeout, streams));
    (exporter, bridge)
}

#[tokio::test(start_paused = true)]
async fn test_responsive_and_silent_rooms() {
    let rooms = vec![
        Room::new("oftc", "!oftc:example.org"),
        Room::new("libera", "!libera:example.org"),
    ];
    let (exporter, bridge) = setup(rooms, &["!libera:example.org"], Duration::from_secs(5));

    let report = exporter.run_cycle().await;
    assert!(report.timed_out);
    assert!(report.delays["libera"].is_success());
    assert!(!report.delays["oftc"].is_success());
    assert!(report.delays["oftc"].ping.is_some());
    assert_eq!(report.unresolved().collect::<Vec<_>>(), vec!["oftc"]);
    assert_eq!(bridge.sent.lock().unwrap().len(), 2);

    let body = matrix_irc_ping_exporter::exposition::render(&report);
    assert!(body.contains("matrix_irc_ping_success{network=\"libera\"} 1"));
    assert!(body.contains("matrix_irc_ping_success{network=\"oftc\"} 0"));
    assert!(body.contains("matrix_irc_ping_timed_out{network=\"oftc\"} 1"));
    assert!(body.contains("matrix_irc_rtt_seconds{network=\"libera\"}"));
    assert!(!body.contains("matrix_irc_rtt_seconds{network=\"oftc\"}"));
}

#[tokio::test(start_paused = true)]
async fn test_all_rooms_answer_before_deadline() {
    let rooms = vec![
        Room::new("a", "!a:example.org"),
        Room::new("b", "!b:example.org"),
    ];
    let (exporter, _) = setup(
        rooms,
        &["!a:example.org", "!b:example.org"],
        Duration::from_secs(60),
    );

    let report = exporter.run_cycle().await;
    assert!(!report.timed_out);
    assert!(report.elapsed < Duration::from_secs(60));
    assert!(report.unresolved().next().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_does_not_abort_cycle() {
    let rooms = vec![
        Room::new("broken", BROKEN_ROOM),
        Room::new("libera", "!libera:example.org"),
    ];
    let (exporter, bridge) = setup(rooms, &["!libera:example.org"], Duration::from_secs(2));

    let report = exporter.run_cycle().await;
    assert!(report.delays["libera"].is_success());
    assert!(report.delays["broken"].ping.is_none());
    assert!(!report.delays["broken"].is_success());
    assert_eq!(bridge.sent.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_cycles_use_fresh_probes() {
    let rooms = vec![Room::new("libera", "!libera:example.org")];
    let (exporter, bridge) = setup(rooms, &["!libera:example.org"], Duration::from_secs(2));

    let (first, second) = tokio::join!(exporter.run_cycle(), exporter.run_cycle());
    assert!(first.delays["libera"].is_success());
    assert!(second.delays["libera"].is_success());

    let first_id = &first.delays["libera"].ping.as_ref().unwrap().id;
    let second_id = &second.delays["libera"].ping.as_ref().unwrap().id;
    assert_ne!(first_id, second_id);
    assert_eq!(bridge.sent.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_sends_bounded_by_deadline() {
    let rooms = vec![
        Room::new("a", BROKEN_ROOM),
        Room::new("b", "!b:example.org"),
        Room::new("c", "!c:example.org"),
    ];
    let (exporter, bridge) = setup_with_delay(
        rooms,
        &["!b:example.org"],
        Duration::from_secs(60),
        Duration::from_secs(90),
    );

    let report = exporter.run_cycle().await;
    assert!(report.elapsed <= Duration::from_secs(60));
    assert!(report.timed_out);
    assert_eq!(report.unresolved().count(), 3);
    assert!(bridge.sent.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cycle_duration_includes_sending() {
    let rooms = vec![
        Room::new("a", "!a:example.org"),
        Room::new("b", "!b:example.org"),
    ];
    let (exporter, _) = setup_with_delay(
        rooms,
        &["!a:example.org", "!b:example.org"],
        Duration::from_secs(60),
        Duration::from_secs(5),
    );

    let report = exporter.run_cycle().await;
    assert!(!report.timed_out);
    // Both sends stall concurrently, not one after the other
    assert!(report.elapsed >= Duration::from_secs(5));
    assert!(report.elapsed < Duration::from_secs(10));
}

#[tokio::test]
async fn test_metrics_endpoint_runs_cycle() {
    let rooms = vec![Room::new("libera", "!libera:example.org")];
    let (exporter, _) = setup(rooms, &["!libera:example.org"], Duration::from_secs(5));

    let server = metrics::serve("127.0.0.1:0".parse().unwrap(), exporter, None)
        .await
        .unwrap();
    let url = format!("http://{}/metrics", server.local_addr());

    let resp = reqwest::get(&url).await.unwrap();
    assert!(resp.status().is_success());
    let body = resp.text().await.unwrap();
    assert!(body.contains("# TYPE matrix_irc_ping_success gauge"));
    assert!(body.contains("matrix_irc_ping_success{network=\"libera\"} 1"));

    let resp = reqwest::get(format!("http://{}/other", server.local_addr()))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(5), server.wait())
        .await
        .unwrap();
}
