use std::net::SocketAddr;
use std::time::Instant;

// ── Domain counters ─────────────────────────────────────────────

/// Counter: reservations admitted as Pending.
pub const RESERVATIONS_CREATED_TOTAL: &str = "reservo_reservations_created_total";

/// Counter: lifecycle transitions. Labels: action (approve, reject, cancel, reschedule).
pub const TRANSITIONS_TOTAL: &str = "reservo_transitions_total";

/// Counter: requests refused by a rule. Labels: kind (validation, conflict, state, ...).
pub const VALIDATION_REJECTIONS_TOTAL: &str = "reservo_validation_rejections_total";

/// Counter: equipment movements. Labels: op (loan, return).
pub const LOANS_TOTAL: &str = "reservo_loans_total";

/// Counter: notifications. Labels: outcome (sent, deduplicated, failed).
pub const NOTIFICATIONS_TOTAL: &str = "reservo_notifications_total";

/// Histogram: engine operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "reservo_operation_duration_seconds";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservo_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservo_wal_flush_batch_size";

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

pub fn record_duration(op: &'static str, started: Instant) {
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
}
