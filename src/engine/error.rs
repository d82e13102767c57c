use ulid::Ulid;

use crate::model::{Ms, Shortfall};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    EmptyCart,
    InvalidQuantity(u32),
    /// Advisory cart check failed.
    InsufficientStock {
        product_id: Ulid,
        available: u32,
        requested: u32,
    },
    /// Checkout reserved nothing; every uncovered product is listed.
    CheckoutConflict(Vec<Shortfall>),
    /// The user still holds live reservations from an earlier checkout.
    CheckoutAlreadyInProgress { expires_at: Ms },
    NotOwner(Ulid),
    HasActiveReservations(Ulid),
    StockBelowCommitted {
        product_id: Ulid,
        requested_total: u32,
        committed: u32,
    },
    /// A lock could not be acquired in time. Retry with backoff.
    ResourceBusy,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::EmptyCart => "empty_cart",
            EngineError::InvalidQuantity(_) => "invalid_quantity",
            EngineError::InsufficientStock { .. } => "insufficient_stock",
            EngineError::CheckoutConflict(_) => "checkout_conflict",
            EngineError::CheckoutAlreadyInProgress { .. } => "checkout_in_progress",
            EngineError::NotOwner(_) => "not_owner",
            EngineError::HasActiveReservations(_) => "has_active_reservations",
            EngineError::StockBelowCommitted { .. } => "stock_below_committed",
            EngineError::ResourceBusy => "resource_busy",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// Worth retrying unchanged after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::ResourceBusy)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::EmptyCart => write!(f, "cart is empty"),
            EngineError::InvalidQuantity(q) => write!(f, "invalid quantity: {q}"),
            EngineError::InsufficientStock {
                product_id,
                available,
                requested,
            } => write!(
                f,
                "insufficient stock for {product_id}: available {available}, requested {requested}"
            ),
            EngineError::CheckoutConflict(shortfalls) => {
                write!(f, "insufficient stock for {} product(s):", shortfalls.len())?;
                for s in shortfalls {
                    write!(
                        f,
                        " {} (available {}, requested {})",
                        s.product_id, s.available, s.requested
                    )?;
                }
                Ok(())
            }
            EngineError::CheckoutAlreadyInProgress { expires_at } => {
                write!(f, "a checkout is already in progress until {expires_at}")
            }
            EngineError::NotOwner(id) => write!(f, "reservation {id} belongs to another user"),
            EngineError::HasActiveReservations(id) => {
                write!(f, "cannot delete product {id}: has pending reservations")
            }
            EngineError::StockBelowCommitted {
                product_id,
                requested_total,
                committed,
            } => write!(
                f,
                "stock total {requested_total} for {product_id} is below committed stock {committed}"
            ),
            EngineError::ResourceBusy => write!(f, "resource busy, retry later"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
