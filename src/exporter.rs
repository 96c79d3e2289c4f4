//! Measurement cycle orchestration.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, time::Instant};

use crate::{
    collector::{collect, CycleReport},
    exposition::render,
    metrics::exporter_metrics,
    sender::send_probes,
    transport::{EventStreams, Room, Transport},
};

/// Runs probe cycles against a set of rooms.
///
/// Cycles are serialized: the event streams are held for the whole cycle, so a
/// concurrent scrape waits for the running one to finish. Every cycle uses a
/// fresh registry.
pub struct Exporter {
    transport: Arc<dyn Transport>,
    rooms: Vec<Room>,
    timeout: Duration,
    streams: Mutex<EventStreams>,
}

impl Exporter {
    pub fn new(
        transport: Arc<dyn Transport>,
        rooms: Vec<Room>,
        timeout: Duration,
        streams: EventStreams,
    ) -> Self {
        let mut rooms = rooms;
        rooms.sort();

        Exporter {
            transport,
            rooms,
            timeout,
            streams: Mutex::new(streams),
        }
    }

    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends probes to every room and waits for the results.
    ///
    /// The deadline starts when the cycle starts and bounds sending as well as
    /// collection, so the call returns within the configured timeout plus the
    /// time spent waiting for a previous cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut streams = self.streams.lock().await;
        let started = Instant::now();
        let deadline = started + self.timeout;

        let registry = send_probes(self.transport.as_ref(), &self.rooms, deadline).await;
        let mut report = collect(&mut streams, &registry, &self.rooms, deadline).await;
        report.elapsed = started.elapsed();

        let unresolved = report.unresolved().count();
        if unresolved > 0 {
            log::info!(
                "Cycle finished with {} of {} rooms unresolved",
                unresolved,
                self.rooms.len()
            );
        }
        exporter_metrics::record_cycle(report.elapsed.as_secs_f64(), unresolved);

        report
    }

    /// Runs a cycle and renders it.
    pub async fn scrape(&self) -> String {
        render(&self.run_cycle().await)
    }
}
