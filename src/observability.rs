use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "stockhold_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "stockhold_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "stockhold_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "stockhold_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "stockhold_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "stockhold_tenants_active";

/// Counter: failed hello handshakes.
pub const AUTH_FAILURES_TOTAL: &str = "stockhold_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stockhold_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "stockhold_wal_flush_batch_size";

/// Counter: exclusive lock acquisitions that ran out of time.
pub const LOCK_TIMEOUTS_TOTAL: &str = "stockhold_lock_timeouts_total";

// ── Stock domain ────────────────────────────────────────────────

/// Counter: checkout attempts. Labels: outcome (reserved, conflict, empty, in_progress, busy, error).
pub const CHECKOUTS_TOTAL: &str = "stockhold_checkouts_total";

/// Counter: pending reservations created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "stockhold_reservations_created_total";

/// Counter: reservations moved to a terminal state. Labels: transition.
pub const SETTLEMENTS_TOTAL: &str = "stockhold_settlements_total";

/// Counter: reservations reclaimed by the sweeper.
pub const SWEEP_EXPIRED_TOTAL: &str = "stockhold_sweep_expired_total";

/// Counter: reservations the sweeper failed to reclaim.
pub const SWEEP_FAILURES_TOTAL: &str = "stockhold_sweep_failures_total";

/// Counter: ledger anomalies detected and clamped.
pub const INVARIANT_VIOLATIONS_TOTAL: &str = "stockhold_invariant_violations_total";

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

/// Map a Request variant to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Hello { .. } => "hello",
        Request::CreateProduct { .. } => "create_product",
        Request::AdjustStock { .. } => "adjust_stock",
        Request::DeleteProduct { .. } => "delete_product",
        Request::GetProduct { .. } => "get_product",
        Request::ListProducts => "list_products",
        Request::AddToCart { .. } => "add_to_cart",
        Request::UpdateCartItem { .. } => "update_cart_item",
        Request::RemoveCartItem { .. } => "remove_cart_item",
        Request::ClearCart { .. } => "clear_cart",
        Request::BulkUpdateCart { .. } => "bulk_update_cart",
        Request::GetCart { .. } => "get_cart",
        Request::Checkout { .. } => "checkout",
        Request::Confirm { .. } => "confirm",
        Request::Cancel { .. } => "cancel",
        Request::Sweep => "sweep",
        Request::UserReservations { .. } => "user_reservations",
        Request::ProductReservations { .. } => "product_reservations",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
        Request::UnlistenAll => "unlisten_all",
    }
}
