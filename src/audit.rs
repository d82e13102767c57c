use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CartAction {
    Add,
    Update,
    Remove,
    Clear,
    BulkUpdate,
}

impl CartAction {
    pub fn as_str(self) -> &'static str {
        match self {
            CartAction::Add => "add",
            CartAction::Update => "update",
            CartAction::Remove => "remove",
            CartAction::Clear => "clear",
            CartAction::BulkUpdate => "bulk_update",
        }
    }
}

/// One cart mutation, as handed to the audit collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartAuditEntry {
    pub user_id: Ulid,
    pub action: CartAction,
    /// `None` for whole-cart actions.
    pub product_id: Option<Ulid>,
    pub quantity_before: u32,
    pub quantity_after: u32,
    pub unit_price: Option<u64>,
    pub at: Ms,
}

/// Where cart audit entries go. Recording must not fail the cart operation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: CartAuditEntry);
}

/// Default sink: one structured log line per entry.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: CartAuditEntry) {
        info!(
            target: "stockhold::audit",
            user = %entry.user_id,
            action = entry.action.as_str(),
            product = ?entry.product_id,
            before = entry.quantity_before,
            after = entry.quantity_after,
            price = ?entry.unit_price,
            "cart change"
        );
    }
}

/// Keeps entries in memory; used by tests to assert on the trail.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<CartAuditEntry>>,
}

impl MemoryAuditSink {
    pub fn entries(&self) -> Vec<CartAuditEntry> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: CartAuditEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}
