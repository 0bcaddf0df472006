//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter.
/// Returns a handle that can be used to retrieve metrics.
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a successful model launch.
pub fn record_launch(model: &str) {
    metrics::counter!("llamactl_launches_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a successful stop, labeled managed or external.
pub fn record_stop(kind: &str) {
    metrics::counter!("llamactl_stops_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a process-table scan that degraded to an empty result.
pub fn record_scan_failure() {
    metrics::counter!("llamactl_scan_failures_total").increment(1);
}

/// Update the running-models gauge (managed + discovered).
pub fn update_running_count(count: usize) {
    metrics::gauge!("llamactl_running_models").set(count as f64);
}
