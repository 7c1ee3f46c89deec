use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "orsched_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "orsched_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "orsched_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "orsched_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "orsched_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "orsched_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "orsched_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "orsched_wal_compactions_total";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: cases registered through the planner.
pub const CASES_CREATED_TOTAL: &str = "orsched_cases_created_total";

/// Counter: cases committed to a room.
pub const CASES_SCHEDULED_TOTAL: &str = "orsched_cases_scheduled_total";

/// Counter: schedule attempts left unchanged. Labels: reason.
pub const UNSCHEDULABLE_TOTAL: &str = "orsched_unschedulable_total";

/// Counter: plans that fell back to the fixed three-phase template. Labels: reason.
pub const PLAN_FALLBACKS_TOTAL: &str = "orsched_plan_fallbacks_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::InsertCase { .. } => "insert_case",
        Command::ScheduleCase { .. } => "schedule_case",
        Command::DeleteCase { .. } => "delete_case",
        Command::SelectCases { .. } => "select_cases",
        Command::SelectTasks { .. } => "select_tasks",
        Command::SelectRooms => "select_rooms",
        Command::SelectNotifications { .. } => "select_notifications",
        Command::SelectSnapshot => "select_snapshot",
        Command::SelectAvailability { .. } => "select_availability",
        Command::Listen { .. } => "listen",
    }
}
