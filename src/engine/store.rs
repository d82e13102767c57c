use std::collections::{BTreeSet, HashMap};

use dashmap::DashMap;
use tracing::warn;
use ulid::Ulid;

use crate::ledger::StockLedger;
use crate::model::*;
use crate::reservation::Reservation;

/// Where a reservation lives and who owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationOwner {
    pub product_id: Ulid,
    pub user_id: Ulid,
}

/// Id-based lookups over reservations: reservation → (product, user),
/// user → reservations, and user → still-pending reservations. The records
/// themselves live in `ProductState`.
///
/// The pending set is only changed while the owning product is write-locked,
/// so a reservation missing from it is settled for good.
#[derive(Default)]
pub struct ReservationIndex {
    by_id: DashMap<Ulid, ReservationOwner>,
    by_user: DashMap<Ulid, Vec<Ulid>>,
    pending_by_user: DashMap<Ulid, BTreeSet<Ulid>>,
}

impl ReservationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, r: &Reservation) {
        let owner = ReservationOwner {
            product_id: r.product_id,
            user_id: r.user_id,
        };
        if self.by_id.insert(r.id, owner).is_none() {
            self.by_user.entry(r.user_id).or_default().push(r.id);
        }
        if r.is_pending() {
            self.pending_by_user.entry(r.user_id).or_default().insert(r.id);
        } else {
            self.unmark_pending(&r.user_id, &r.id);
        }
    }

    /// Drop `id` from its user's pending set once it leaves `pending`.
    pub fn mark_settled(&self, r: &Reservation) {
        if !r.is_pending() {
            self.unmark_pending(&r.user_id, &r.id);
        }
    }

    fn unmark_pending(&self, user_id: &Ulid, id: &Ulid) {
        let now_empty = match self.pending_by_user.get_mut(user_id) {
            Some(mut ids) => {
                ids.remove(id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.pending_by_user.remove_if(user_id, |_, ids| ids.is_empty());
        }
    }

    pub fn remove(&self, id: &Ulid) {
        if let Some((_, owner)) = self.by_id.remove(id) {
            self.unmark_pending(&owner.user_id, id);
            let now_empty = match self.by_user.get_mut(&owner.user_id) {
                Some(mut ids) => {
                    ids.retain(|r| r != id);
                    ids.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.by_user.remove_if(&owner.user_id, |_, ids| ids.is_empty());
            }
        }
    }

    pub fn locate(&self, id: &Ulid) -> Option<ReservationOwner> {
        self.by_id.get(id).map(|e| *e.value())
    }

    pub fn for_user(&self, user_id: &Ulid) -> Vec<Ulid> {
        self.by_user
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// The user's reservations that were pending when last touched, with
    /// their products. Callers re-check the status under the product lock.
    pub fn pending_for_user(&self, user_id: &Ulid) -> Vec<(Ulid, Ulid)> {
        let Some(ids) = self.pending_by_user.get(user_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        ids.into_iter()
            .filter_map(|id| self.locate(&id).map(|owner| (id, owner.product_id)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

// ── Event application ────────────────────────────────────

/// Apply the part of `event` that concerns `ps` (caller holds its write lock).
///
/// Product creation and deletion happen at the map level and are ignored here.
pub(super) fn apply_to_product(ps: &mut ProductState, event: &Event, index: &ReservationIndex) {
    match event {
        Event::StockAdjusted { id, stock_total } if *id == ps.id => {
            if let Err(e) = ps.ledger.set_total(*stock_total) {
                warn!("product {id}: stock adjustment not applied: {e}");
            }
        }
        Event::ReservationsPlaced { reservations, .. } => {
            for r in reservations.iter().filter(|r| r.product_id == ps.id) {
                if let Err(e) = ps.ledger.reserve(r.quantity) {
                    warn!("product {}: reservation {} not applied: {e}", ps.id, r.id);
                    continue;
                }
                index.insert(r);
                ps.reservations.insert(r.id, r.clone());
            }
        }
        Event::ReservationsSettled {
            transition,
            at,
            targets,
        } => {
            for target in targets.iter().filter(|t| t.product_id == ps.id) {
                let Some(r) = ps.reservations.get_mut(&target.id) else {
                    warn!("product {}: settled reservation {} is unknown", ps.id, target.id);
                    continue;
                };
                if let Err(e) = r.settle(*transition, *at, &mut ps.ledger) {
                    warn!("reservation {}: {transition:?} not applied: {e}", target.id);
                }
                index.mark_settled(r);
            }
        }
        Event::ReservationRestored { reservation } if reservation.product_id == ps.id => {
            index.insert(reservation);
            ps.reservations.insert(reservation.id, reservation.clone());
        }
        _ => {}
    }
}

/// Apply a cart event (caller holds the cart's write lock).
pub(super) fn apply_to_cart(cart: &mut CartState, event: &Event) {
    match event {
        Event::CartItemSet {
            product_id,
            quantity,
            unit_price,
            ..
        } => {
            cart.lines.insert(
                *product_id,
                CartLine {
                    product_id: *product_id,
                    quantity: *quantity,
                    unit_price: *unit_price,
                },
            );
        }
        Event::CartItemRemoved { product_id, .. } => {
            cart.lines.remove(product_id);
        }
        Event::CartCleared { .. } => cart.lines.clear(),
        _ => {}
    }
}

/// Owned state rebuilt from the log before anything is shared.
#[derive(Default)]
pub(super) struct ReplayState {
    pub products: HashMap<Ulid, ProductState>,
    pub carts: HashMap<Ulid, CartState>,
}

impl ReplayState {
    pub fn apply(&mut self, event: &Event, index: &ReservationIndex) {
        match event {
            Event::ProductCreated {
                id,
                name,
                unit_price,
                stock_total,
            } => {
                self.products
                    .insert(*id, ProductState::new(*id, name.clone(), *unit_price, *stock_total));
            }
            Event::ProductRestored {
                id,
                name,
                unit_price,
                stock_total,
                stock_reserved,
                stock_sold,
            } => {
                let mut ps = ProductState::new(*id, name.clone(), *unit_price, 0);
                ps.ledger = StockLedger::restore(*stock_total, *stock_reserved, *stock_sold);
                self.products.insert(*id, ps);
            }
            Event::ProductDeleted { id } => {
                if let Some(ps) = self.products.remove(id) {
                    for rid in ps.reservations.keys() {
                        index.remove(rid);
                    }
                }
            }
            Event::CartItemSet { user_id, .. }
            | Event::CartItemRemoved { user_id, .. }
            | Event::CartCleared { user_id } => {
                let cart = self
                    .carts
                    .entry(*user_id)
                    .or_insert_with(|| CartState::new(*user_id));
                apply_to_cart(cart, event);
            }
            other => {
                for pid in other.product_ids() {
                    match self.products.get_mut(&pid) {
                        Some(ps) => apply_to_product(ps, other, index),
                        None => warn!("replay: event for unknown product {pid} skipped"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservation::{ReservationStatus, Transition, DEFAULT_TTL_MS};

    #[test]
    fn index_tracks_users() {
        let index = ReservationIndex::new();
        let user = Ulid::new();
        let a = Reservation::pending(Ulid::new(), user, Ulid::new(), 1, 0, DEFAULT_TTL_MS);
        let b = Reservation::pending(Ulid::new(), user, Ulid::new(), 1, 0, DEFAULT_TTL_MS);
        index.insert(&a);
        index.insert(&b);
        index.insert(&a);
        assert_eq!(index.for_user(&user), vec![a.id, b.id]);
        assert_eq!(index.locate(&a.id).map(|o| o.user_id), Some(user));

        index.remove(&a.id);
        index.remove(&b.id);
        assert!(index.for_user(&user).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn replay_places_and_settles() {
        let index = ReservationIndex::new();
        let mut state = ReplayState::default();
        let pid = Ulid::new();
        let user = Ulid::new();
        let r = Reservation::pending(Ulid::new(), user, pid, 4, 1_000, DEFAULT_TTL_MS);

        state.apply(
            &Event::ProductCreated { id: pid, name: None, unit_price: 10, stock_total: 10 },
            &index,
        );
        state.apply(
            &Event::ReservationsPlaced { user_id: user, reservations: vec![r.clone()] },
            &index,
        );
        assert_eq!(state.products[&pid].ledger.reserved(), 4);

        state.apply(
            &Event::ReservationsSettled {
                transition: Transition::Confirm,
                at: 2_000,
                targets: vec![ReservationRef { id: r.id, product_id: pid }],
            },
            &index,
        );
        let ps = &state.products[&pid];
        assert_eq!(ps.ledger.reserved(), 0);
        assert_eq!(ps.ledger.sold(), 4);
        assert_eq!(ps.reservations[&r.id].status(), ReservationStatus::Confirmed);
        assert!(index.pending_for_user(&user).is_empty());
        assert_eq!(index.for_user(&user), vec![r.id]);
    }

    #[test]
    fn pending_set_follows_settlement() {
        let index = ReservationIndex::new();
        let user = Ulid::new();
        let pid = Ulid::new();
        let mut ledger = StockLedger::new(5);
        let mut a = Reservation::pending(Ulid::new(), user, pid, 1, 0, DEFAULT_TTL_MS);
        let b = Reservation::pending(Ulid::new(), user, pid, 1, 0, DEFAULT_TTL_MS);
        ledger.reserve(2).unwrap();
        index.insert(&a);
        index.insert(&b);
        assert_eq!(index.pending_for_user(&user).len(), 2);

        a.settle(Transition::Cancel, 10, &mut ledger).unwrap();
        index.mark_settled(&a);
        assert_eq!(index.pending_for_user(&user), vec![(b.id, pid)]);

        index.remove(&b.id);
        assert!(index.pending_for_user(&user).is_empty());
        assert_eq!(index.for_user(&user), vec![a.id]);
    }

    #[test]
    fn replay_skips_unknown_product() {
        let index = ReservationIndex::new();
        let mut state = ReplayState::default();
        let r = Reservation::pending(Ulid::new(), Ulid::new(), Ulid::new(), 1, 0, DEFAULT_TTL_MS);
        state.apply(
            &Event::ReservationsPlaced { user_id: r.user_id, reservations: vec![r] },
            &index,
        );
        assert!(state.products.is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn cart_events_build_lines() {
        let index = ReservationIndex::new();
        let mut state = ReplayState::default();
        let (user, p1, p2) = (Ulid::new(), Ulid::new(), Ulid::new());
        for (pid, qty) in [(p1, 2), (p2, 1), (p1, 5)] {
            state.apply(
                &Event::CartItemSet { user_id: user, product_id: pid, quantity: qty, unit_price: 100 },
                &index,
            );
        }
        state.apply(&Event::CartItemRemoved { user_id: user, product_id: p2 }, &index);
        let cart = &state.carts[&user];
        assert_eq!(cart.lines.len(), 1);
        assert_eq!(cart.lines[&p1].quantity, 5);
    }
}
