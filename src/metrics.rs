//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a container launch
pub fn record_container_started(model: &str, port: u16) {
    metrics::counter!("nim_manager_containers_started_total",
        "model" => model.to_string(),
        "port" => port.to_string()
    )
    .increment(1);
}

/// Record a container stop issued by the manager
pub fn record_container_stopped(model: &str, forced: bool) {
    metrics::counter!("nim_manager_containers_stopped_total",
        "model" => model.to_string(),
        "forced" => forced.to_string()
    )
    .increment(1);
}

/// Record an orphaned container being reclaimed
pub fn record_orphan_reclaimed(model: &str) {
    metrics::counter!("nim_manager_orphans_reclaimed_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a failed image pull
pub fn record_pull_failure(model: &str) {
    metrics::counter!("nim_manager_pull_failures_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Update the run record gauge
pub fn update_record_count(count: usize) {
    metrics::gauge!("nim_manager_run_records").set(count as f64);
}
