use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "flightline_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "flightline_request_duration_seconds";

// ── Ledger outcomes ─────────────────────────────────────────────

/// Counter: bookings refused because the window was taken.
pub const CONFLICTS_TOTAL: &str = "flightline_conflicts_total";

/// Counter: billing records derived from usage.
pub const BILLING_DERIVED_TOTAL: &str = "flightline_billing_derived_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "flightline_connections_active";

pub const CONNECTIONS_TOTAL: &str = "flightline_connections_total";

/// Counter: connections turned away at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "flightline_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "flightline_wal_flush_duration_seconds";

/// Histogram: mutations per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "flightline_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
