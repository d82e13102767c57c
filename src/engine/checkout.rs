use std::collections::{BTreeMap, BTreeSet};

use tokio::time::Instant;
use tracing::{debug, info};
use ulid::Ulid;

use crate::ledger::{LedgerError, StockLedger};
use crate::model::*;
use crate::observability::{CHECKOUTS_TOTAL, RESERVATIONS_CREATED_TOTAL};
use crate::reservation::{Reservation, Transition};

use super::locking::{now_ms, ProductGuard};
use super::{Engine, EngineError};

fn outcome_label(result: &Result<CheckoutReceipt, EngineError>) -> &'static str {
    match result {
        Ok(_) => "reserved",
        Err(EngineError::CheckoutConflict(_)) => "conflict",
        Err(EngineError::EmptyCart) => "empty",
        Err(EngineError::CheckoutAlreadyInProgress { .. }) => "in_progress",
        Err(EngineError::ResourceBusy) => "busy",
        Err(_) => "error",
    }
}

/// A reservation drafted against a scratch copy of its product's ledger.
struct Draft {
    reservation: Reservation,
    ledger: StockLedger,
}

impl Engine {
    /// Reserve stock for the user's whole cart, or nothing at all.
    pub async fn checkout(&self, user_id: Ulid) -> Result<CheckoutReceipt, EngineError> {
        self.checkout_at(user_id, now_ms()).await
    }

    pub async fn checkout_at(&self, user_id: Ulid, now: Ms) -> Result<CheckoutReceipt, EngineError> {
        let result = self.run_checkout(user_id, now).await;
        metrics::counter!(CHECKOUTS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        result
    }

    async fn run_checkout(&self, user_id: Ulid, now: Ms) -> Result<CheckoutReceipt, EngineError> {
        // Only lock acquisition is bounded by the deadline. Once everything
        // is held, the commit runs to completion.
        let deadline = Instant::now() + self.config.checkout_timeout;

        let _permit = self.commit_permit(Some(deadline)).await?;
        // Holding the cart lock serializes checkouts of the same user.
        let cart = self.lock_cart(user_id, Some(deadline)).await?;
        if cart.is_empty() {
            return Err(EngineError::EmptyCart);
        }

        let mut wanted: BTreeMap<Ulid, u64> = BTreeMap::new();
        for line in cart.lines.values() {
            *wanted.entry(line.product_id).or_default() += u64::from(line.quantity);
        }

        // Settled history is never locked; only products with a hold that
        // may still be pending join the lock set.
        let previous = self.index.pending_for_user(&user_id);
        let mut lock_set: BTreeSet<Ulid> = wanted.keys().copied().collect();
        lock_set.extend(previous.iter().map(|&(_, product_id)| product_id));
        let mut guards = self.lock_products(&lock_set, Some(deadline)).await?;

        self.settle_previous(user_id, &previous, &mut guards, now).await?;

        let ttl = self.config.reservation_ttl_ms;
        let mut drafts: Vec<Draft> = Vec::with_capacity(wanted.len());
        let mut shortfalls = Vec::new();
        for (&product_id, &qty) in &wanted {
            let requested = u32::try_from(qty).unwrap_or(u32::MAX);
            let Some(guard) = guards.get(&product_id) else {
                shortfalls.push(Shortfall {
                    product_id,
                    available: 0,
                    requested,
                });
                continue;
            };
            let mut ledger = guard.ledger;
            match ledger.reserve(requested) {
                Ok(()) => drafts.push(Draft {
                    reservation: Reservation::pending(
                        Ulid::new(),
                        user_id,
                        product_id,
                        requested,
                        now,
                        ttl,
                    ),
                    ledger,
                }),
                Err(LedgerError::InsufficientStock { available, requested }) => {
                    shortfalls.push(Shortfall {
                        product_id,
                        available,
                        requested,
                    });
                }
                Err(_) => shortfalls.push(Shortfall {
                    product_id,
                    available: ledger.available(),
                    requested,
                }),
            }
        }

        if !shortfalls.is_empty() {
            // Unwind in reverse. The drafts only ever touched scratch ledgers
            // and were never persisted, so the live counters are untouched.
            for draft in drafts.iter_mut().rev() {
                let _ = draft
                    .reservation
                    .settle(Transition::Cancel, now, &mut draft.ledger);
            }
            debug!(
                "checkout for {user_id} rolled back {} draft(s), {} shortfall(s)",
                drafts.len(),
                shortfalls.len()
            );
            return Err(EngineError::CheckoutConflict(shortfalls));
        }

        let reservations: Vec<Reservation> = drafts.into_iter().map(|d| d.reservation).collect();
        let receipt = CheckoutReceipt {
            reservations: reservations.iter().map(ReservationSummary::from).collect(),
            expires_at: now + ttl,
            ttl_minutes: ttl / 60_000,
        };
        let count = reservations.len();
        let event = Event::ReservationsPlaced {
            user_id,
            reservations,
        };
        self.persist_and_apply_all(guards.values_mut(), &event).await?;
        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(count as u64);
        info!("checkout for {user_id}: {count} reservation(s) held until {}", receipt.expires_at);
        drop(cart);
        Ok(receipt)
    }

    /// Deal with reservations left over from the user's earlier checkouts.
    /// Live ones block the new attempt; lapsed ones go through the same
    /// expiry path the sweeper uses before anything new is drafted.
    async fn settle_previous(
        &self,
        user_id: Ulid,
        previous: &[(Ulid, Ulid)],
        guards: &mut BTreeMap<Ulid, ProductGuard>,
        now: Ms,
    ) -> Result<(), EngineError> {
        let mut lapsed = Vec::new();
        let mut live_until: Option<Ms> = None;
        for &(rid, product_id) in previous {
            let Some(r) = guards
                .get(&product_id)
                .and_then(|g| g.reservations.get(&rid))
            else {
                continue;
            };
            if !r.is_pending() {
                continue;
            }
            if r.is_lapsed(now) {
                lapsed.push(ReservationRef { id: rid, product_id });
            } else {
                live_until = Some(live_until.map_or(r.expires_at, |t| t.max(r.expires_at)));
            }
        }

        if let Some(expires_at) = live_until {
            return Err(EngineError::CheckoutAlreadyInProgress { expires_at });
        }
        if lapsed.is_empty() {
            return Ok(());
        }

        let outcome = self.expire_locked(guards, &lapsed, now).await?;
        debug!("checkout for {user_id}: expired {} lapsed reservation(s) first", outcome.expired);
        Ok(())
    }
}
