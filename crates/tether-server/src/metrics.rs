//! Metrics collection and export for the Tether server.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tether_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tether_connections_active";
    pub const FRAMES_TOTAL: &str = "tether_frames_total";
    pub const FRAMES_BYTES: &str = "tether_frames_bytes";
    pub const CHANNELS_ACTIVE: &str = "tether_channels_active";
    pub const JOINS_TOTAL: &str = "tether_joins_total";
    pub const EVENTS_TOTAL: &str = "tether_events_total";
    pub const LATENCY_SECONDS: &str = "tether_latency_seconds";
    pub const ERRORS_TOTAL: &str = "tether_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of hosted channels");
    metrics::describe_counter!(names::JOINS_TOTAL, "Total number of accepted joins");
    metrics::describe_counter!(
        names::EVENTS_TOTAL,
        "Total number of events applied to hosted channels"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record frame processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an accepted join.
pub fn record_join() {
    counter!(names::JOINS_TOTAL).increment(1);
}

/// Record an event applied to a hosted channel.
pub fn record_event(kind: &str) {
    counter!(names::EVENTS_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Update hosted channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
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
