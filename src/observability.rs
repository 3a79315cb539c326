use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "formacal_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "formacal_query_duration_seconds";

/// Counter: availability checks. Labels: verdict.
pub const CHECKS_TOTAL: &str = "formacal_checks_total";

/// Histogram: availability check latency in seconds.
pub const CHECK_DURATION_SECONDS: &str = "formacal_check_duration_seconds";

/// Counter: conflicts reported by checks. Labels: kind, severity.
pub const CONFLICTS_TOTAL: &str = "formacal_conflicts_total";

/// Counter: commit attempts. Labels: outcome.
pub const COMMITS_TOTAL: &str = "formacal_commits_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "formacal_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "formacal_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "formacal_connections_rejected_total";

/// Gauge: number of loaded organizations.
pub const ORGANIZATIONS_ACTIVE: &str = "formacal_organizations_active";

/// Histogram: time spent waiting for commit locks, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "formacal_lock_wait_seconds";

/// Counter: commit lock acquisitions that timed out (reported as Busy).
pub const LOCK_TIMEOUTS_TOTAL: &str = "formacal_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "formacal_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "formacal_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertInstructor { .. } => "upsert_instructor",
        Command::SelectInstructors => "select_instructors",
        Command::InsertBlackout { .. } => "insert_blackout",
        Command::DeleteBlackout { .. } => "delete_blackout",
        Command::SelectBlackouts { .. } => "select_blackouts",
        Command::CheckAvailability { .. } => "check_availability",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
    }
}
