use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "hotel_booking_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "hotel_booking_query_duration_seconds";

// ── Domain counters ─────────────────────────────────────────────

pub const BOOKINGS_CREATED_TOTAL: &str = "hotel_booking_bookings_created_total";
pub const BOOKINGS_CANCELLED_TOTAL: &str = "hotel_booking_bookings_cancelled_total";

/// Counter: reservations rejected because the room was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "hotel_booking_conflicts_total";

/// Counter: reserves retried after a transient store conflict.
pub const RESERVE_RETRIES_TOTAL: &str = "hotel_booking_reserve_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "hotel_booking_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "hotel_booking_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "hotel_booking_connections_rejected_total";

/// Counter: sessions refused because the startup user is not a valid id.
pub const AUTH_FAILURES_TOTAL: &str = "hotel_booking_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "hotel_booking_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "hotel_booking_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom { .. } => "insert_room",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectBookings { id: None } => "select_bookings",
        Command::SelectBookings { id: Some(_) } => "select_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectRooms { .. } => "select_rooms",
    }
}
