//! Prometheus text rendering of a measurement cycle.

use std::fmt::Write;

use crate::{
    collector::CycleReport,
    delay::{Delay, Segment, Segments},
    time::as_seconds,
};

const SUCCESS: &str = "matrix_irc_ping_success";
const TIMED_OUT: &str = "matrix_irc_ping_timed_out";
const ANOMALY: &str = "matrix_irc_clock_skew_anomaly";
const ANOMALY_SECONDS: &str = "matrix_irc_clock_skew_anomaly_seconds";

/// Metric name and help text for a latency segment.
fn segment_metric(segment: Segment) -> (&'static str, &'static str) {
    match segment {
        Segment::ToRelay => (
            "matrix_irc_ping_matrix_delay_seconds",
            "Delay from sending the ping to its arrival on the homeserver",
        ),
        Segment::FromRelay => (
            "matrix_irc_ping_echo_delay_seconds",
            "Delay from the homeserver to the local reception of the ping echo",
        ),
        Segment::RelayToResponder => (
            "matrix_irc_ping_irc_delay_seconds",
            "Delay from the homeserver to the IRC responder",
        ),
        Segment::ToResponder => (
            "matrix_irc_ping_delay_seconds",
            "Delay from sending the ping to the IRC responder",
        ),
        Segment::ReplyToRelay => (
            "matrix_irc_pong_irc_delay_seconds",
            "Delay from the IRC responder to the homeserver",
        ),
        Segment::RelayToLocal => (
            "matrix_irc_pong_matrix_delay_seconds",
            "Delay from the homeserver to the local reception of the pong",
        ),
        Segment::ReturnLeg => (
            "matrix_irc_pong_delay_seconds",
            "Delay from the IRC responder to the local reception of the pong",
        ),
        Segment::Total => (
            "matrix_irc_rtt_seconds",
            "Round trip time from sending the ping to receiving the pong",
        ),
    }
}

/// Renders the per-room results of a cycle.
///
/// Every room gets a success and a timeout line even when nothing was
/// received. Duration gauges are only written for defined segments; negative
/// durations are written unchanged and flagged with an anomaly line.
pub fn render(report: &CycleReport) -> String {
    let rooms: Vec<(&str, &Delay, Segments)> = report
        .delays
        .iter()
        .map(|(name, delay)| (name.as_str(), delay, delay.segments()))
        .collect();

    let mut output = String::new();

    write_header(
        &mut output,
        SUCCESS,
        "Whether a pong was received for the last ping",
    );
    for (name, delay, _) in &rooms {
        let _ = writeln!(
            output,
            "{}{{network=\"{}\"}} {}",
            SUCCESS,
            escape_label(name),
            u8::from(delay.is_success())
        );
    }

    write_header(
        &mut output,
        TIMED_OUT,
        "Whether the cycle deadline passed before both ping and pong arrived",
    );
    for (name, delay, _) in &rooms {
        let _ = writeln!(
            output,
            "{}{{network=\"{}\"}} {}",
            TIMED_OUT,
            escape_label(name),
            u8::from(!delay.is_complete())
        );
    }

    for segment in Segment::ALL {
        let (metric, help) = segment_metric(segment);
        let values: Vec<_> = rooms
            .iter()
            .filter_map(|(name, _, s)| s.get(segment).map(|d| (*name, d)))
            .collect();
        if values.is_empty() {
            continue;
        }

        write_header(&mut output, metric, help);
        for (name, d) in values {
            let _ = writeln!(
                output,
                "{}{{network=\"{}\"}} {}",
                metric,
                escape_label(name),
                as_seconds(d)
            );
        }
    }

    let anomalies: Vec<_> = rooms
        .iter()
        .flat_map(|(name, _, s)| s.anomalies().map(move |(seg, d)| (*name, seg, d)))
        .collect();
    if !anomalies.is_empty() {
        write_header(
            &mut output,
            ANOMALY,
            "Latency segment came out negative, indicating clock skew",
        );
        for (name, segment, _) in &anomalies {
            let _ = writeln!(
                output,
                "{}{{network=\"{}\",segment=\"{}\"}} 1",
                ANOMALY,
                escape_label(name),
                segment
            );
        }

        write_header(
            &mut output,
            ANOMALY_SECONDS,
            "Magnitude of a negative latency segment",
        );
        for (name, segment, d) in &anomalies {
            let _ = writeln!(
                output,
                "{}{{network=\"{}\",segment=\"{}\"}} {}",
                ANOMALY_SECONDS,
                escape_label(name),
                segment,
                as_seconds(*d)
            );
        }
    }

    output
}

fn write_header(output: &mut String, metric: &str, help: &str) {
    let _ = writeln!(output, "# HELP {} {}", metric, help);
    let _ = writeln!(output, "# TYPE {} gauge", metric);
}

/// Escapes a label value for the text exposition format.
fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}
