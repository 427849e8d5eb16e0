//! Metrics collection and export for Switchboard.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use switchboard_core::StatsSnapshot;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "switchboard_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "switchboard_connections_active";
    pub const SESSIONS_LOCAL: &str = "switchboard_sessions_local";
    pub const MESSAGES_TOTAL: &str = "switchboard_messages_total";
    pub const MESSAGES_BYTES: &str = "switchboard_messages_bytes";
    pub const ROUTED_TOTAL: &str = "switchboard_routed_total";
    pub const INGEST_LATENCY_SECONDS: &str = "switchboard_ingest_latency_seconds";
    pub const HANDSHAKES_REJECTED_TOTAL: &str = "switchboard_handshakes_rejected_total";
    pub const ERRORS_TOTAL: &str = "switchboard_errors_total";
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
    metrics::describe_gauge!(
        names::SESSIONS_LOCAL,
        "Users with a session in this node's table"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(
        names::ROUTED_TOTAL,
        "Envelopes handled by the router, by outcome"
    );
    metrics::describe_histogram!(
        names::INGEST_LATENCY_SECONDS,
        "Time to parse and enqueue an inbound payload"
    );
    metrics::describe_counter!(
        names::HANDSHAKES_REJECTED_TOTAL,
        "Upgrade requests refused before the handshake"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record how long an inbound payload took to reach the queue.
pub fn record_ingest_latency(seconds: f64) {
    histogram!(names::INGEST_LATENCY_SECONDS).record(seconds);
}

/// Record a refused upgrade.
pub fn record_rejected_handshake(reason: &'static str) {
    counter!(names::HANDSHAKES_REJECTED_TOTAL, "reason" => reason).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish the router's counters and the local session count.
pub fn export_router_stats(stats: &StatsSnapshot, local_sessions: usize) {
    let outcomes = [
        ("delivered", stats.delivered),
        ("relayed", stats.relayed),
        ("relay_delivered", stats.relay_delivered),
        ("relay_ignored", stats.relay_ignored),
        ("dropped", stats.dropped),
        ("malformed", stats.malformed),
    ];
    for (outcome, value) in outcomes {
        counter!(names::ROUTED_TOTAL, "outcome" => outcome).absolute(value);
    }
    gauge!(names::SESSIONS_LOCAL).set(local_sessions as f64);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; recording must be a no-op.
        let _guard = ConnectionMetricsGuard::new();
    }

    #[test]
    fn test_export_without_recorder() {
        let stats = StatsSnapshot {
            delivered: 3,
            relayed: 2,
            ..StatsSnapshot::default()
        };
        export_router_stats(&stats, 5);
    }
}
