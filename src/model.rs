use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::ledger::StockLedger;
use crate::reservation::{Reservation, ReservationStatus, Transition};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Stock record for one product, plus every reservation made against it.
///
/// Reservations live next to the ledger so that one write lock covers a
/// status transition and its ledger effect.
#[derive(Debug, Clone)]
pub struct ProductState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Minor currency units.
    pub unit_price: u64,
    pub ledger: StockLedger,
    pub reservations: BTreeMap<Ulid, Reservation>,
}

impl ProductState {
    pub fn new(id: Ulid, name: Option<String>, unit_price: u64, stock_total: u32) -> Self {
        Self {
            id,
            name,
            unit_price,
            ledger: StockLedger::new(stock_total),
            reservations: BTreeMap::new(),
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values().filter(|r| r.is_pending())
    }

    pub fn has_pending(&self) -> bool {
        self.pending().next().is_some()
    }

    /// Sum of quantities over pending reservations. Always equals `ledger.reserved()`.
    pub fn pending_quantity(&self) -> u64 {
        self.pending().map(|r| u64::from(r.quantity)).sum()
    }

    /// Pending reservations whose TTL has elapsed at `now`.
    pub fn lapsed(&self, now: Ms) -> impl Iterator<Item = &Reservation> {
        self.pending().filter(move |r| r.is_lapsed(now))
    }

    pub fn info(&self) -> ProductInfo {
        ProductInfo {
            id: self.id,
            name: self.name.clone(),
            unit_price: self.unit_price,
            stock_total: self.ledger.total(),
            stock_reserved: self.ledger.reserved(),
            stock_sold: self.ledger.sold(),
            available: self.ledger.available(),
        }
    }
}

/// One staged line in a cart. The price is a snapshot taken when the line was first added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Ulid,
    pub quantity: u32,
    pub unit_price: u64,
}

impl CartLine {
    pub fn subtotal(&self) -> u64 {
        self.unit_price.saturating_mul(u64::from(self.quantity))
    }
}

/// A user's staging list. Keyed by product, so one line per product.
#[derive(Debug, Clone)]
pub struct CartState {
    pub user_id: Ulid,
    pub lines: BTreeMap<Ulid, CartLine>,
}

impl CartState {
    pub fn new(user_id: Ulid) -> Self {
        Self {
            user_id,
            lines: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn total_items(&self) -> u64 {
        self.lines.values().map(|l| u64::from(l.quantity)).sum()
    }

    pub fn total_price(&self) -> u64 {
        self.lines.values().map(CartLine::subtotal).sum()
    }

    pub fn view(&self) -> CartView {
        CartView {
            user_id: self.user_id,
            lines: self.lines.values().cloned().collect(),
            total_items: self.total_items(),
            total_price: self.total_price(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRef {
    pub id: Ulid,
    pub product_id: Ulid,
}

/// Flat event enum, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProductCreated {
        id: Ulid,
        name: Option<String>,
        unit_price: u64,
        stock_total: u32,
    },
    StockAdjusted {
        id: Ulid,
        stock_total: u32,
    },
    ProductDeleted {
        id: Ulid,
    },
    /// Compaction snapshot of a product's counters. Reservations follow as
    /// `ReservationRestored` and do not touch the ledger.
    ProductRestored {
        id: Ulid,
        name: Option<String>,
        unit_price: u64,
        stock_total: u32,
        stock_reserved: u32,
        stock_sold: u32,
    },
    /// A whole checkout: every reservation is placed, or the event does not exist.
    ReservationsPlaced {
        user_id: Ulid,
        reservations: Vec<Reservation>,
    },
    /// Terminal transitions applied together, each with its ledger effect.
    ReservationsSettled {
        transition: Transition,
        at: Ms,
        targets: Vec<ReservationRef>,
    },
    ReservationRestored {
        reservation: Reservation,
    },
    CartItemSet {
        user_id: Ulid,
        product_id: Ulid,
        quantity: u32,
        unit_price: u64,
    },
    CartItemRemoved {
        user_id: Ulid,
        product_id: Ulid,
    },
    CartCleared {
        user_id: Ulid,
    },
}

impl Event {
    /// Products whose state this event changes.
    pub fn product_ids(&self) -> Vec<Ulid> {
        match self {
            Event::ProductCreated { id, .. }
            | Event::StockAdjusted { id, .. }
            | Event::ProductDeleted { id }
            | Event::ProductRestored { id, .. } => vec![*id],
            Event::ReservationsPlaced { reservations, .. } => {
                let mut ids: Vec<Ulid> = reservations.iter().map(|r| r.product_id).collect();
                ids.sort();
                ids.dedup();
                ids
            }
            Event::ReservationsSettled { targets, .. } => {
                let mut ids: Vec<Ulid> = targets.iter().map(|t| t.product_id).collect();
                ids.sort();
                ids.dedup();
                ids
            }
            Event::ReservationRestored { reservation } => vec![reservation.product_id],
            Event::CartItemSet { .. } | Event::CartItemRemoved { .. } | Event::CartCleared { .. } => {
                vec![]
            }
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub unit_price: u64,
    pub stock_total: u32,
    pub stock_reserved: u32,
    pub stock_sold: u32,
    pub available: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartView {
    pub user_id: Ulid,
    pub lines: Vec<CartLine>,
    pub total_items: u64,
    pub total_price: u64,
}

/// One product a checkout could not cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shortfall {
    pub product_id: Ulid,
    pub available: u32,
    pub requested: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationSummary {
    pub id: Ulid,
    pub product_id: Ulid,
    pub quantity: u32,
    pub expires_at: Ms,
}

impl From<&Reservation> for ReservationSummary {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            product_id: r.product_id,
            quantity: r.quantity,
            expires_at: r.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutReceipt {
    pub reservations: Vec<ReservationSummary>,
    pub expires_at: Ms,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SettlementFailure {
    /// The hold lapsed before payment confirmation; the user must check out again.
    Expired { id: Ulid, expires_at: Ms },
    NotPending { id: Ulid, status: ReservationStatus },
}

impl SettlementFailure {
    pub fn id(&self) -> Ulid {
        match self {
            SettlementFailure::Expired { id, .. } | SettlementFailure::NotPending { id, .. } => *id,
        }
    }
}

/// Outcome of a confirm or cancel call. Every requested id appears exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettlementReport {
    pub applied: Vec<Ulid>,
    pub failed: Vec<SettlementFailure>,
}

impl SettlementReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Reservations whose hold lapsed; their products need a fresh checkout.
    pub fn requires_checkout(&self) -> Vec<Ulid> {
        self.failed
            .iter()
            .filter(|f| matches!(f, SettlementFailure::Expired { .. }))
            .map(SettlementFailure::id)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    /// Already settled by someone else between scan and lock.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedUpdate {
    pub product_id: Ulid,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkUpdateReport {
    pub updated: Vec<Ulid>,
    pub removed: Vec<Ulid>,
    pub skipped: Vec<SkippedUpdate>,
    pub cart: Option<CartView>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservation::DEFAULT_TTL_MS;

    fn reservation(product_id: Ulid, qty: u32, created_at: Ms) -> Reservation {
        Reservation::pending(Ulid::new(), Ulid::new(), product_id, qty, created_at, DEFAULT_TTL_MS)
    }

    #[test]
    fn pending_quantity_ignores_terminal() {
        let mut ps = ProductState::new(Ulid::new(), None, 100, 20);
        let mut a = reservation(ps.id, 3, 0);
        let b = reservation(ps.id, 4, 0);
        ps.ledger.reserve(3).unwrap();
        ps.ledger.reserve(4).unwrap();
        a.settle(Transition::Confirm, 10, &mut ps.ledger).unwrap();
        ps.reservations.insert(a.id, a);
        ps.reservations.insert(b.id, b);
        assert_eq!(ps.pending_quantity(), 4);
        assert_eq!(u64::from(ps.ledger.reserved()), ps.pending_quantity());
        assert!(ps.has_pending());
    }

    #[test]
    fn lapsed_filters_by_time() {
        let mut ps = ProductState::new(Ulid::new(), None, 100, 20);
        let early = reservation(ps.id, 1, 0);
        let late = reservation(ps.id, 1, 10_000);
        let early_id = early.id;
        ps.reservations.insert(early.id, early);
        ps.reservations.insert(late.id, late);
        let lapsed: Vec<Ulid> = ps.lapsed(DEFAULT_TTL_MS + 1).map(|r| r.id).collect();
        assert_eq!(lapsed, vec![early_id]);
    }

    #[test]
    fn cart_totals() {
        let mut cart = CartState::new(Ulid::new());
        let p1 = Ulid::new();
        let p2 = Ulid::new();
        cart.lines.insert(p1, CartLine { product_id: p1, quantity: 2, unit_price: 250 });
        cart.lines.insert(p2, CartLine { product_id: p2, quantity: 3, unit_price: 100 });
        assert_eq!(cart.total_items(), 5);
        assert_eq!(cart.total_price(), 800);
        let view = cart.view();
        assert_eq!(view.lines.len(), 2);
    }

    #[test]
    fn product_ids_dedup_for_checkout() {
        let p = Ulid::new();
        let event = Event::ReservationsPlaced {
            user_id: Ulid::new(),
            reservations: vec![reservation(p, 1, 0), reservation(p, 2, 0)],
        };
        assert_eq!(event.product_ids(), vec![p]);
    }

    #[test]
    fn settlement_report_lists_lapsed() {
        let lapsed = Ulid::new();
        let report = SettlementReport {
            applied: vec![Ulid::new()],
            failed: vec![
                SettlementFailure::Expired { id: lapsed, expires_at: 5 },
                SettlementFailure::NotPending {
                    id: Ulid::new(),
                    status: ReservationStatus::Cancelled,
                },
            ],
        };
        assert!(!report.is_complete());
        assert_eq!(report.requires_checkout(), vec![lapsed]);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationsPlaced {
            user_id: Ulid::new(),
            reservations: vec![reservation(Ulid::new(), 2, 1_000)],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
