//! Process counters for the ping responder.

use metrics::counter;

/// Records that a ping was seen by the responder.
pub fn record_ping_received(network: &str) {
    counter!("matrix_irc_responder_pings_received_total", "network" => network.to_string())
        .increment(1);
}

/// Records that a pong was sent.
pub fn record_pong_sent(network: &str) {
    counter!("matrix_irc_responder_pongs_sent_total", "network" => network.to_string())
        .increment(1);
}

/// Records that a pong could not be sent or queued.
pub fn record_pong_failure(network: &str) {
    counter!("matrix_irc_responder_pong_failures_total", "network" => network.to_string())
        .increment(1);
}
