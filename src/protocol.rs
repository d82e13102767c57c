//! Newline-delimited JSON request/response format.
//!
//! Each request is one JSON object tagged by `op`. Each reply is one line:
//! `{"ok":true,"data":...}` or `{"ok":false,"error":{"code":...,"message":...}}`.
//! Change notifications arrive interleaved as `{"notify":{...}}` lines.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::Event;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BulkItem {
    pub product_id: Ulid,
    /// 0 removes the line; out-of-range values are skipped.
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        tenant: String,
        password: String,
    },
    CreateProduct {
        #[serde(default)]
        id: Option<Ulid>,
        #[serde(default)]
        name: Option<String>,
        unit_price: u64,
        stock_total: u32,
    },
    AdjustStock {
        id: Ulid,
        stock_total: u32,
    },
    DeleteProduct {
        id: Ulid,
    },
    GetProduct {
        id: Ulid,
    },
    ListProducts,
    AddToCart {
        user_id: Ulid,
        product_id: Ulid,
        quantity: u32,
    },
    UpdateCartItem {
        user_id: Ulid,
        product_id: Ulid,
        quantity: u32,
    },
    RemoveCartItem {
        user_id: Ulid,
        product_id: Ulid,
    },
    ClearCart {
        user_id: Ulid,
    },
    BulkUpdateCart {
        user_id: Ulid,
        items: Vec<BulkItem>,
    },
    GetCart {
        user_id: Ulid,
    },
    Checkout {
        user_id: Ulid,
    },
    Confirm {
        user_id: Ulid,
        reservation_ids: Vec<Ulid>,
    },
    Cancel {
        user_id: Ulid,
        reservation_ids: Vec<Ulid>,
    },
    Sweep,
    UserReservations {
        user_id: Ulid,
    },
    ProductReservations {
        product_id: Ulid,
    },
    Listen {
        product_id: Ulid,
    },
    Unlisten {
        product_id: Ulid,
    },
    UnlistenAll,
}

#[derive(Debug)]
pub enum ProtocolError {
    Malformed(String),
    NotAuthenticated,
    AuthFailed,
    AlreadyAuthenticated,
    Tenant(String),
    LineTooLong,
    Io(std::io::Error),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed_request",
            ProtocolError::NotAuthenticated => "not_authenticated",
            ProtocolError::AuthFailed => "auth_failed",
            ProtocolError::AlreadyAuthenticated => "already_authenticated",
            ProtocolError::Tenant(_) => "tenant_error",
            ProtocolError::LineTooLong => "line_too_long",
            ProtocolError::Io(_) => "io_error",
        }
    }

    /// The connection cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::AuthFailed | ProtocolError::LineTooLong | ProtocolError::Io(_)
        )
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "malformed request: {e}"),
            ProtocolError::NotAuthenticated => write!(f, "send hello first"),
            ProtocolError::AuthFailed => write!(f, "authentication failed"),
            ProtocolError::AlreadyAuthenticated => write!(f, "hello already accepted"),
            ProtocolError::Tenant(e) => write!(f, "tenant error: {e}"),
            ProtocolError::LineTooLong => write!(f, "request line too long"),
            ProtocolError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

pub fn ok(data: impl Serialize) -> String {
    let data = serde_json::to_value(data).unwrap_or(Value::Null);
    json!({ "ok": true, "data": data }).to_string()
}

pub fn protocol_error(e: &ProtocolError) -> String {
    json!({
        "ok": false,
        "error": { "code": e.code(), "message": e.to_string() },
    })
    .to_string()
}

/// Engine errors carry their structured details next to the message.
pub fn engine_error(e: &EngineError) -> String {
    let mut body = json!({ "code": e.code(), "message": e.to_string() });
    let details = match e {
        EngineError::NotFound(id)
        | EngineError::AlreadyExists(id)
        | EngineError::NotOwner(id)
        | EngineError::HasActiveReservations(id) => json!({ "id": id }),
        EngineError::InvalidQuantity(q) => json!({ "quantity": q }),
        EngineError::InsufficientStock {
            product_id,
            available,
            requested,
        } => json!({
            "product_id": product_id,
            "available": available,
            "requested": requested,
        }),
        EngineError::CheckoutConflict(shortfalls) => json!({ "shortfalls": shortfalls }),
        EngineError::CheckoutAlreadyInProgress { expires_at } => {
            json!({ "expires_at": expires_at })
        }
        EngineError::StockBelowCommitted {
            product_id,
            requested_total,
            committed,
        } => json!({
            "product_id": product_id,
            "requested_total": requested_total,
            "committed": committed,
        }),
        EngineError::ResourceBusy => json!({ "retry": true }),
        _ => Value::Null,
    };
    if let (Value::Object(body), Value::Object(details)) = (&mut body, details) {
        body.extend(details);
    }
    json!({ "ok": false, "error": body }).to_string()
}

pub fn notification(product_id: Ulid, event: &Event) -> String {
    json!({ "notify": { "product_id": product_id, "event": event } }).to_string()
}

pub fn lagged(product_id: Ulid, missed: u64) -> String {
    json!({ "notify": { "product_id": product_id, "lagged": missed } }).to_string()
}
