use std::net::SocketAddr;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "branchbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "branchbook_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome (`booked` or the rejection kind).
pub const BOOKINGS_TOTAL: &str = "branchbook_bookings_total";

/// Histogram: time to compute one day of slots, in seconds.
pub const SLOT_QUERY_DURATION_SECONDS: &str = "branchbook_slot_query_duration_seconds";

/// Counter: notification send attempts. Labels: notifier.
pub const NOTIFY_ATTEMPTS_TOTAL: &str = "branchbook_notify_attempts_total";

/// Counter: notifications abandoned after the last retry. Labels: notifier.
pub const NOTIFY_FAILURES_TOTAL: &str = "branchbook_notify_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "branchbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "branchbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "branchbook_connections_rejected_total";

/// Gauge: live appointments in the store.
pub const APPOINTMENTS_LIVE: &str = "branchbook_appointments_live";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "branchbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "branchbook_wal_flush_batch_size";

/// Install the global tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("branchbook=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

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
        Command::SelectTopics => "select_topics",
        Command::SelectBranches { .. } => "select_branches",
        Command::SelectBusinessHours { .. } => "select_business_hours",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectAvailableDates { .. } => "select_available_dates",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::DeleteAllAppointments => "delete_all_appointments",
        Command::ResendConfirmation { .. } => "resend_confirmation",
    }
}
