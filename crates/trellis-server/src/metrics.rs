//! Metrics collection and export for the gateway.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "trellis_connections_total";
    pub const SESSIONS_ACTIVE: &str = "trellis_sessions_active";
    pub const MESSAGES_TOTAL: &str = "trellis_messages_total";
    pub const MESSAGES_BYTES: &str = "trellis_messages_bytes";
    pub const LOGINS_TOTAL: &str = "trellis_logins_total";
    pub const SESSIONS_REAPED_TOTAL: &str = "trellis_sessions_reaped_total";
    pub const DISPATCH_SECONDS: &str = "trellis_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "trellis_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of live sessions");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of envelopes processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of envelopes processed");
    metrics::describe_counter!(names::LOGINS_TOTAL, "Total login attempts by outcome");
    metrics::describe_counter!(
        names::SESSIONS_REAPED_TOTAL,
        "Total sessions closed for idleness"
    );
    metrics::describe_histogram!(names::DISPATCH_SECONDS, "Envelope dispatch latency in seconds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::SESSIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
}

/// Record an envelope.
pub fn record_message(bytes: usize, direction: &str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction.to_string()).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction.to_string()).increment(bytes as u64);
}

/// Record a login attempt.
pub fn record_login(success: bool) {
    let outcome = if success { "approved" } else { "denied" };
    counter!(names::LOGINS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record sessions closed for idleness.
pub fn record_reaped(count: usize) {
    counter!(names::SESSIONS_REAPED_TOTAL).increment(count as u64);
}

/// Record dispatch latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
