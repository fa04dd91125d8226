//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define server metrics (requests, latency, rejections, workers, restarts)
//! - Expose Prometheus-compatible metrics endpoint (standalone mode)
//!
//! # Metrics
//! - `multiserve_requests_total` (counter): completed requests by service, status
//! - `multiserve_request_duration_seconds` (histogram): latency by service
//! - `multiserve_rejected_total` (counter): requests refused before a worker ran,
//!   by reason (`invalid`, `no_match`, `unavailable`, `tls`)
//! - `multiserve_active_workers` (gauge): workers running application code
//! - `multiserve_child_restarts_total` (counter): supervisor child restarts
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; with no recorder installed
//!   every call is a no-op, so supervised children pay nothing

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record one completed request.
pub fn record_request(service: &str, status: u16, start: Instant) {
    let service = service.to_string();
    metrics::counter!(
        "multiserve_requests_total",
        "service" => service.clone(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("multiserve_request_duration_seconds", "service" => service)
        .record(start.elapsed().as_secs_f64());
}

/// Record a request refused before any application code ran.
pub fn record_rejected(reason: &'static str) {
    metrics::counter!("multiserve_rejected_total", "reason" => reason).increment(1);
}

/// Publish the number of workers currently inside application code.
pub fn set_active_workers(service: &str, active: usize) {
    metrics::gauge!("multiserve_active_workers", "service" => service.to_string()).set(active as f64);
}

pub fn record_child_restart() {
    metrics::counter!("multiserve_child_restarts_total").increment(1);
}
