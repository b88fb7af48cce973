//! Metrics collection and exposition.
//!
//! # Metrics
//! - `servemux_connections_accepted_total` (counter)
//! - `servemux_active_connections` (gauge)
//! - `servemux_accept_errors_total` (counter): by kind (temporary, fatal)
//! - `servemux_requests_total` (counter): by status
//! - `servemux_request_duration_seconds` (histogram)
//! - `servemux_decode_errors_total` (counter): by kind
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Without an installed recorder every call is a no-op, so library users
//!   and tests pay nothing

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter listening on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn connection_accepted() {
    metrics::counter!("servemux_connections_accepted_total").increment(1);
}

pub fn connection_opened() {
    metrics::gauge!("servemux_active_connections").increment(1.0);
}

pub fn connection_closed() {
    metrics::gauge!("servemux_active_connections").decrement(1.0);
}

/// Record an accept failure; `temporary` selects the label.
pub fn accept_error(temporary: bool) {
    let kind = if temporary { "temporary" } else { "fatal" };
    metrics::counter!("servemux_accept_errors_total", "kind" => kind).increment(1);
}

pub fn decode_error(kind: &'static str) {
    metrics::counter!("servemux_decode_errors_total", "kind" => kind).increment(1);
}

/// Record a completed request.
pub fn record_request(status: u16, start: Instant) {
    metrics::counter!("servemux_requests_total", "status" => status.to_string()).increment(1);
    metrics::histogram!("servemux_request_duration_seconds")
        .record(start.elapsed().as_secs_f64());
}
