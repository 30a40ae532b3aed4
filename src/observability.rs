use std::net::SocketAddr;

use crate::rpc::Function;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total RPC calls. Labels: function, status.
pub const REQUESTS_TOTAL: &str = "slotbook_requests_total";

/// Histogram: RPC latency in seconds. Labels: function.
pub const REQUEST_DURATION_SECONDS: &str = "slotbook_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservations committed.
pub const BOOKINGS_TOTAL: &str = "slotbook_bookings_total";

/// Counter: refused bookings. Labels: reason (error code).
pub const BOOKING_REJECTIONS_TOTAL: &str = "slotbook_booking_rejections_total";

/// Counter: unbook calls that took effect. Labels: mode (self, forced, requested).
pub const UNBOOKINGS_TOTAL: &str = "slotbook_unbookings_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Counter: requests carrying a wrong service token.
pub const AUTH_FAILURES_TOTAL: &str = "slotbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Function variant to a short label for metrics.
pub fn function_label(function: &Function) -> &'static str {
    match function {
        Function::CreateSlot { .. } => "create_slot",
        Function::UpdateSlot { .. } => "update_slot",
        Function::DeleteSlot { .. } => "delete_slot",
        Function::GetAllSlots => "get_all_slots",
        Function::GetMySlots => "get_my_slots",
        Function::GetStudentSlots { .. } => "get_student_slots",
        Function::GetSupervisorSlots => "get_supervisor_slots",
        Function::AddSlotFilter { .. } => "add_slot_filter",
        Function::DeleteSlotFilter { .. } => "delete_slot_filter",
        Function::GetSlotFilters { .. } => "get_slot_filters",
        Function::AddSlotSupervisor { .. } => "add_slot_supervisor",
        Function::RemoveSlotSupervisor { .. } => "remove_slot_supervisor",
        Function::BookReservation { .. } => "book_reservation",
        Function::UnbookReservation { .. } => "unbook_reservation",
        Function::GetSlotReservations { .. } => "get_slot_reservations",
        Function::GetMyReservations => "get_my_reservations",
        Function::Listen => "listen",
        Function::Unlisten => "unlisten",
    }
}
