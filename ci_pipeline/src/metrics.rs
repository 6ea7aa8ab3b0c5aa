//! Prometheus exporter for the step-execution metrics.

use std::net::SocketAddr;

/// Install the Prometheus exporter, listening on `listen`.
pub fn init_metrics(listen: SocketAddr) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(listen);
    match builder.install() {
        Ok(()) => tracing::info!(%listen, "Prometheus exporter listening"),
        Err(e) => tracing::warn!("Failed to install Prometheus exporter: {}", e),
    }
}
