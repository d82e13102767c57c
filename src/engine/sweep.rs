use std::collections::BTreeMap;

use tracing::{debug, error, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{SETTLEMENTS_TOTAL, SWEEP_EXPIRED_TOTAL, SWEEP_FAILURES_TOTAL};
use crate::reservation::Transition;

use super::locking::{now_ms, read_within, ProductGuard};
use super::{Engine, EngineError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct ExpiryOutcome {
    pub expired: usize,
    pub skipped: usize,
}

impl Engine {
    /// Pending reservations whose TTL has elapsed at `now`, grouped by product.
    /// A product whose lock cannot be read in time is reported in the error list.
    pub async fn lapsed_reservations(&self, now: Ms) -> (BTreeMap<Ulid, Vec<Ulid>>, Vec<Ulid>) {
        let states: Vec<(Ulid, _)> = self
            .products
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut lapsed: BTreeMap<Ulid, Vec<Ulid>> = BTreeMap::new();
        let mut unreadable = Vec::new();
        for (product_id, state) in states {
            match read_within(state, self.config.lock_timeout).await {
                Ok(guard) => {
                    let ids: Vec<Ulid> = guard.lapsed(now).map(|r| r.id).collect();
                    if !ids.is_empty() {
                        lapsed.insert(product_id, ids);
                    }
                }
                Err(_) => unreadable.push(product_id),
            }
        }
        (lapsed, unreadable)
    }

    /// Move lapsed reservations to `expired`. Every `pending → expired`
    /// transition goes through here, whether the periodic sweep or a checkout
    /// clearing the user's own lapsed holds asked for it.
    ///
    /// The caller holds write locks on the products of `candidates`. A
    /// candidate that is no longer pending, or not yet lapsed at `now`, is
    /// skipped. All expirations are persisted as one event.
    pub(super) async fn expire_locked(
        &self,
        guards: &mut BTreeMap<Ulid, ProductGuard>,
        candidates: &[ReservationRef],
        now: Ms,
    ) -> Result<ExpiryOutcome, EngineError> {
        let mut outcome = ExpiryOutcome::default();
        let mut targets = Vec::with_capacity(candidates.len());
        for target in candidates {
            let still_lapsed = guards
                .get(&target.product_id)
                .and_then(|g| g.reservations.get(&target.id))
                .is_some_and(|r| r.check(Transition::Expire, now).is_ok());
            if still_lapsed {
                targets.push(*target);
            } else {
                debug!("reservation {} no longer lapsed, not expiring", target.id);
                outcome.skipped += 1;
            }
        }
        if targets.is_empty() {
            return Ok(outcome);
        }

        let count = targets.len();
        let event = Event::ReservationsSettled {
            transition: Transition::Expire,
            at: now,
            targets,
        };
        self.persist_and_apply_all(guards.values_mut(), &event).await?;
        metrics::counter!(SWEEP_EXPIRED_TOTAL).increment(count as u64);
        metrics::counter!(SETTLEMENTS_TOTAL, "transition" => "expire").increment(count as u64);
        outcome.expired = count;
        Ok(outcome)
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(now_ms()).await
    }

    /// Expire every pending reservation whose TTL elapsed before `now`.
    ///
    /// Each candidate is re-checked under its product's write lock; one that
    /// was confirmed or cancelled in the meantime is skipped. A failure on
    /// one product is logged and counted, and the sweep moves on.
    pub async fn sweep_at(&self, now: Ms) -> SweepReport {
        let mut report = SweepReport::default();
        let (candidates, unreadable) = self.lapsed_reservations(now).await;
        for product_id in unreadable {
            error!("sweep: product {product_id} busy during scan, retrying next sweep");
            report.failed += 1;
        }

        for (product_id, ids) in candidates {
            report.scanned += ids.len();
            let permit = match self.commit_permit(None).await {
                Ok(p) => p,
                Err(e) => {
                    error!("sweep: cannot start commit for product {product_id}: {e}");
                    report.failed += ids.len();
                    metrics::counter!(SWEEP_FAILURES_TOTAL).increment(ids.len() as u64);
                    continue;
                }
            };
            let guard = match self.lock_product(product_id, None).await {
                Ok(g) => g,
                Err(e) => {
                    error!("sweep: cannot lock product {product_id}: {e}");
                    report.failed += ids.len();
                    metrics::counter!(SWEEP_FAILURES_TOTAL).increment(ids.len() as u64);
                    continue;
                }
            };

            let mut guards = BTreeMap::from([(product_id, guard)]);
            let targets: Vec<ReservationRef> = ids
                .iter()
                .map(|&id| ReservationRef { id, product_id })
                .collect();
            let result = self.expire_locked(&mut guards, &targets, now).await;
            drop(guards);
            drop(permit);
            match result {
                Ok(outcome) => {
                    report.expired += outcome.expired;
                    report.skipped += outcome.skipped;
                }
                Err(e) => {
                    error!("sweep: expiring {} reservation(s) on {product_id} failed: {e}", ids.len());
                    report.failed += ids.len();
                    metrics::counter!(SWEEP_FAILURES_TOTAL).increment(ids.len() as u64);
                }
            }
        }

        if report.expired > 0 || report.failed > 0 {
            info!(
                "sweep: {} expired, {} skipped, {} failed of {} lapsed",
                report.expired, report.skipped, report.failed, report.scanned
            );
        }
        report
    }
}
