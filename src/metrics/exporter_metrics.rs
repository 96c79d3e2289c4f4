//! Process counters for the exporter side.
//!
//! Cumulative across cycles, unlike the per-cycle gauges rendered by
//! [`crate::exposition`].

use metrics::{counter, histogram};

/// Records that a probe was handed to the transport.
pub fn record_probe_sent(network: &str) {
    counter!("matrix_irc_probes_sent_total", "network" => network.to_string()).increment(1);
}

/// Records that sending a probe failed.
pub fn record_probe_send_failure(network: &str) {
    counter!("matrix_irc_probe_send_failures_total", "network" => network.to_string())
        .increment(1);
}

/// Records that an inbound message was discarded.
///
/// # Arguments
/// * `reason` - "malformed", "unknown_id", "duplicate" or "missing_ping"
pub fn record_message_discarded(reason: &str) {
    counter!("matrix_irc_messages_discarded_total", "reason" => reason.to_string()).increment(1);
}

/// Records that an event was dropped because its queue was full.
pub fn record_queue_drop() {
    counter!("matrix_irc_queue_dropped_total").increment(1);
}

/// Records a finished cycle.
pub fn record_cycle(seconds: f64, unresolved_rooms: usize) {
    counter!("matrix_irc_cycles_total").increment(1);
    counter!("matrix_irc_unresolved_rooms_total").increment(unresolved_rooms as u64);
    histogram!("matrix_irc_cycle_duration_seconds").record(seconds);
}
