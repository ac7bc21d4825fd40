use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "allocd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "allocd_query_duration_seconds";

// ── Engine metrics ──────────────────────────────────────────────

/// Counter: overrides that deleted or truncated at least one allocation.
pub const OVERRIDES_TOTAL: &str = "allocd_overrides_total";

/// Counter: overrides undone after a store failure.
pub const OVERRIDE_ROLLBACKS_TOTAL: &str = "allocd_override_rollbacks_total";

/// Counter: writes refused because of existing allocations. Labels: reason.
pub const CONFLICTS_TOTAL: &str = "allocd_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "allocd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "allocd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "allocd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "allocd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "allocd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "allocd_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "allocd_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
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
        Command::InsertEmployee { .. } => "insert_employee",
        Command::InsertProject { .. } => "insert_project",
        Command::InsertPhase { .. } => "insert_phase",
        Command::InsertAllocation { .. } => "insert_allocation",
        Command::UpdateAllocation { .. } => "update_allocation",
        Command::DeleteAllocation { .. } => "delete_allocation",
        Command::UnassignProject { .. } => "unassign_project",
        Command::UnassignPhase { .. } => "unassign_phase",
        Command::SelectAllocations { .. } => "select_allocations",
        Command::SelectOverlaps { .. } => "select_overlaps",
        Command::SelectOverridePlan { .. } => "select_override_plan",
        Command::ExecuteOverride { .. } => "execute_override",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
