//! Matrix-IRC bridge latency exporter.
//!
//! This crate measures how long messages take to cross a Matrix-IRC bridge.
//! Every Prometheus scrape sends a timestamped probe into each configured
//! Matrix room, waits for the bridge to echo it and for an IRC-side responder
//! to answer, and reports per-segment delays.
//!
//! # Usage
//!
//! Run the exporter with its IRC responders:
//! ```bash
//! matrix-irc-ping-exporter --config config.toml --addr 0.0.0.0:9200 --timeout 60
//! ```
//!
//! Run a standalone responder on the IRC side:
//! ```bash
//! ping-responder --server irc.libera.chat:6697 --tls --channels '#ping-test'
//! ```

/// Response collection for one cycle.
pub mod collector;
/// Command-line and file configuration.
pub mod configuration;
/// Delay records and segment computation.
pub mod delay;
/// Probe cycle orchestration.
pub mod exporter;
/// Prometheus text rendering of cycle results.
pub mod exposition;
/// IRC transport.
pub mod irc;
/// Matrix transport and the `!ping` command.
pub mod matrix;
/// Metrics endpoint and process counters.
pub mod metrics;
/// Probe wire format and ids.
pub mod probe;
/// Per-cycle probe registry.
pub mod registry;
/// Far-side ping responder.
pub mod responder;
/// Probe sending.
pub mod sender;
/// Timestamp helpers.
pub mod time;
/// Transport abstraction and ingestion queues.
pub mod transport;
