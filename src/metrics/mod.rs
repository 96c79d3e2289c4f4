//! Prometheus endpoint for the exporter.
//!
//! Every scrape of `/metrics` runs one probe cycle and returns its per-room
//! gauges, followed by the process counters collected through the `metrics`
//! facade.
//!
//! # Usage
//!
//! Start the exporter:
//! ```bash
//! matrix-irc-ping-exporter --addr 127.0.0.1:9200 --config config.toml
//! ```
//!
//! Fetch metrics (takes up to the configured timeout):
//! ```bash
//! curl http://127.0.0.1:9200/metrics
//! ```

pub mod exporter_metrics;
pub mod responder_metrics;

use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::exporter::Exporter;

/// Error type for metrics initialization failures.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build the Prometheus recorder.
    #[error("Failed to build metrics recorder: {0}")]
    RecorderBuild(String),
    /// Failed to bind the HTTP server.
    #[error("Failed to bind metrics server: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handle to the running metrics server.
pub struct MetricsServer {
    /// Cancellation token to stop the server.
    cancel: CancellationToken,
    local_addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl MetricsServer {
    /// Signals the metrics server to shut down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the server task to finish.
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

#[derive(Clone)]
struct AppState {
    exporter: Arc<Exporter>,
    recorder: Option<PrometheusHandle>,
}

/// Installs the global Prometheus recorder for the process counters.
pub fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    // Cycle durations range from milliseconds up to the scrape timeout
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_seconds".to_string()),
            &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
        )
        .map_err(|e| MetricsError::RecorderBuild(e.to_string()))?
        .install_recorder()
        .map_err(|e| MetricsError::RecorderBuild(e.to_string()))
}

/// Builds the HTTP router serving `/metrics`.
pub fn router(exporter: Arc<Exporter>, recorder: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { exporter, recorder })
}

/// Binds `addr` and serves `/metrics` until shut down.
///
/// # Arguments
/// * `addr` - The address to bind the HTTP server to
/// * `exporter` - Runs a probe cycle per request
/// * `recorder` - Process counters appended to every response, if installed
pub async fn serve(
    addr: SocketAddr,
    exporter: Arc<Exporter>,
    recorder: Option<PrometheusHandle>,
) -> Result<MetricsServer, MetricsError> {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    let app = router(exporter, recorder);

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    log::info!("Metrics server listening on http://{}/metrics", local_addr);

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_clone.cancelled().await;
            })
            .await
        {
            log::error!("Metrics server error: {}", e);
        }
    });

    Ok(MetricsServer {
        cancel,
        local_addr,
        task,
    })
}

/// HTTP handler that runs a probe cycle and renders the results.
async fn metrics_handler(State(state): State<AppState>) -> String {
    let mut body = state.exporter.scrape().await;
    if let Some(recorder) = state.recorder {
        body.push('\n');
        body.push_str(&recorder.render());
    }
    body
}
