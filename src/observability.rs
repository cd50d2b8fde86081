use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotguard_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotguard_query_duration_seconds";

/// Counter: admission decisions for create/reschedule. Labels: operation, outcome.
pub const ADMISSIONS_TOTAL: &str = "slotguard_admissions_total";

/// Counter: status changes applied. Labels: to.
pub const STATUS_CHANGES_TOTAL: &str = "slotguard_status_changes_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotguard_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotguard_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotguard_connections_rejected_total";

/// Counter: resource lock waits that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "slotguard_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotguard_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotguard_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertWorkspace { .. } => "insert_workspace",
        Command::UpdateWorkspace { .. } => "update_workspace",
        Command::DeleteWorkspace { .. } => "delete_workspace",
        Command::SelectWorkspaces { .. } => "select_workspaces",
        Command::InsertBooking(_) => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { purge: false, .. } => "cancel_booking",
        Command::DeleteBooking { purge: true, .. } => "purge_booking",
        Command::SelectBookings { .. } => "select_bookings",
    }
}

/// Short label for an admission outcome.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "admitted",
        Err(EngineError::Conflict { .. }) => "conflict",
        Err(EngineError::Validation(_)) => "invalid",
        Err(EngineError::TransientStore(_)) => "transient",
        Err(_) => "rejected",
    }
}
