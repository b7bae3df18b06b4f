use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "courtbook_bookings_total";

/// Histogram: create_booking latency in seconds, lock wait included.
pub const BOOKING_DURATION_SECONDS: &str = "courtbook_booking_duration_seconds";

/// Counter: settled deposit payments. Labels: outcome.
pub const PAYMENTS_TOTAL: &str = "courtbook_payments_total";

/// Counter: notifications published. Labels: event.
pub const NOTIFICATIONS_TOTAL: &str = "courtbook_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: time spent waiting for a resource lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "courtbook_lock_wait_seconds";

/// Counter: lock acquisitions that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "courtbook_lock_timeouts_total";

/// Gauge: resource keys currently held.
pub const LOCKS_HELD: &str = "courtbook_locks_held";

/// Histogram: commit duration (validate + WAL fsync + apply) in seconds.
pub const COMMIT_DURATION_SECONDS: &str = "courtbook_commit_duration_seconds";

// ── Background jobs ─────────────────────────────────────────────

/// Gauge: integrity reports in `detected` state after the last scan.
pub const INTEGRITY_ISSUES_OPEN: &str = "courtbook_integrity_issues_open";

/// Counter: unpaid reservations cancelled by the reaper.
pub const RESERVATIONS_REAPED_TOTAL: &str = "courtbook_reservations_reaped_total";

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

