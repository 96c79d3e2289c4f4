use futures::future::join_all;
use tokio::time::{timeout_at, Instant};

use crate::{
    metrics::exporter_metrics,
    probe::format_ping,
    registry::ProbeRegistry,
    transport::{Room, Transport},
};

/// Sends one probe to every room concurrently and returns the registry of
/// issued probes.
///
/// Every probe is registered before any send starts. Sends still pending at
/// `deadline` are abandoned. A failed or abandoned send is logged and counted;
/// the room simply times out during collection.
pub async fn send_probes(
    transport: &dyn Transport,
    rooms: &[Room],
    deadline: Instant,
) -> ProbeRegistry {
    log::info!("Sending {} pings via {}", rooms.len(), transport.name());

    let mut registry = ProbeRegistry::with_capacity(rooms.len());
    let outgoing: Vec<(&Room, String)> = rooms
        .iter()
        .map(|room| {
            let probe = registry.issue(&room.name);
            log::debug!("Sending ping with ID {} to {}", probe.id, room.destination);
            (room, format_ping(&probe.id, probe.issued_at))
        })
        .collect();

    let sends = outgoing.iter().map(|(room, text)| async move {
        match timeout_at(deadline, transport.send(&room.destination, text)).await {
            Ok(Ok(())) => exporter_metrics::record_probe_sent(&room.name),
            Ok(Err(e)) => {
                log::warn!("Error sending ping to room {}: {}", room.name, e);
                exporter_metrics::record_probe_send_failure(&room.name);
            }
            Err(_) => {
                log::warn!("Timed out sending ping to room {}", room.name);
                exporter_metrics::record_probe_send_failure(&room.name);
            }
        }
    });
    join_all(sends).await;

    registry
}
