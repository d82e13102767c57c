//! Hard limits guarding memory and request size per tenant.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_PRODUCTS_PER_TENANT: usize = 100_000;
pub const MAX_NAME_LEN: usize = 255;

/// Largest quantity a single cart line may hold.
pub const MAX_CART_QUANTITY: u32 = 999;
pub const MAX_CART_LINES: usize = 200;

/// Upper bound on ids accepted by a single confirm/cancel call.
pub const MAX_SETTLEMENT_BATCH: usize = 500;

/// Largest physical stock a product may carry.
pub const MAX_STOCK_TOTAL: u32 = 1_000_000_000;

/// Longest request line a connection may send.
pub const MAX_REQUEST_LINE_LEN: usize = 1024 * 1024;
pub const MAX_LISTENS_PER_CONNECTION: usize = 1024;
