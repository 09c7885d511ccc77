use std::net::SocketAddr;

use anyhow::Context;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "chairbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "chairbook_query_duration_seconds";

/// Counter: commit attempts by final outcome. Labels: outcome.
pub const COMMITS_TOTAL: &str = "chairbook_commits_total";

/// Histogram: end-to-end commit latency in seconds, retries included.
pub const COMMIT_DURATION_SECONDS: &str = "chairbook_commit_duration_seconds";

/// Counter: commit retries after a transient store error.
pub const COMMIT_RETRIES_TOTAL: &str = "chairbook_commit_retries_total";

/// Counter: notifications that failed or timed out. Labels: kind.
pub const NOTIFY_FAILURES_TOTAL: &str = "chairbook_notify_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "chairbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "chairbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "chairbook_connections_rejected_total";

/// Histogram: time spent waiting for a provider's write lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "chairbook_lock_wait_seconds";

/// Counter: provider lock acquisitions that timed out.
pub const LOCK_TIMEOUTS_TOTAL: &str = "chairbook_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chairbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "chairbook_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const COMPACTIONS_TOTAL: &str = "chairbook_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> anyhow::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus metrics exporter")?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a parsed statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertShop { .. } => "insert_shop",
        Command::InsertProvider { .. } => "insert_provider",
        Command::DeleteProvider { .. } => "delete_provider",
        Command::InsertService { .. } => "insert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertAppointment(_) => "insert_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectAppointments { .. } => "select_appointments",
    }
}
