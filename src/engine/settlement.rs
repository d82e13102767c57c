use std::collections::{BTreeSet, HashSet};

use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_SETTLEMENT_BATCH;
use crate::model::*;
use crate::reservation::{Transition, TransitionError};

use super::locking::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Payment succeeded: reserved units become sold.
    pub async fn confirm(&self, user_id: Ulid, ids: &[Ulid]) -> Result<SettlementReport, EngineError> {
        self.settle_batch(user_id, ids, Transition::Confirm, now_ms()).await
    }

    /// Payment failed or the user gave up: reserved units go back to available.
    pub async fn cancel(&self, user_id: Ulid, ids: &[Ulid]) -> Result<SettlementReport, EngineError> {
        self.settle_batch(user_id, ids, Transition::Cancel, now_ms()).await
    }

    pub async fn confirm_at(
        &self,
        user_id: Ulid,
        ids: &[Ulid],
        now: Ms,
    ) -> Result<SettlementReport, EngineError> {
        self.settle_batch(user_id, ids, Transition::Confirm, now).await
    }

    pub async fn cancel_at(
        &self,
        user_id: Ulid,
        ids: &[Ulid],
        now: Ms,
    ) -> Result<SettlementReport, EngineError> {
        self.settle_batch(user_id, ids, Transition::Cancel, now).await
    }

    /// Ownership and existence are checked for every id before anything is
    /// applied; one bad id rejects the whole call. After that, each
    /// reservation is applied or reported individually.
    async fn settle_batch(
        &self,
        user_id: Ulid,
        ids: &[Ulid],
        transition: Transition,
        now: Ms,
    ) -> Result<SettlementReport, EngineError> {
        if ids.len() > MAX_SETTLEMENT_BATCH {
            return Err(EngineError::LimitExceeded("too many reservations in one call"));
        }
        let mut seen = HashSet::with_capacity(ids.len());
        let ids: Vec<Ulid> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if ids.is_empty() {
            return Ok(SettlementReport::default());
        }

        let mut products = BTreeSet::new();
        for id in &ids {
            let owner = self.index.locate(id).ok_or(EngineError::NotFound(*id))?;
            if owner.user_id != user_id {
                return Err(EngineError::NotOwner(*id));
            }
            products.insert(owner.product_id);
        }

        let _permit = self.commit_permit(None).await?;
        let mut guards = self.lock_products(&products, None).await?;

        let mut report = SettlementReport::default();
        let mut targets = Vec::new();
        for id in &ids {
            let record = self.index.locate(id).and_then(|owner| {
                guards
                    .get(&owner.product_id)
                    .and_then(|g| g.reservations.get(id))
            });
            // Product deleted while we waited for its lock.
            let Some(r) = record else {
                return Err(EngineError::NotFound(*id));
            };
            match r.check(transition, now) {
                Ok(()) => {
                    report.applied.push(*id);
                    targets.push(ReservationRef {
                        id: *id,
                        product_id: r.product_id,
                    });
                }
                Err(TransitionError::Lapsed { expires_at }) => {
                    report.failed.push(SettlementFailure::Expired {
                        id: *id,
                        expires_at,
                    });
                }
                Err(TransitionError::NotPending(status)) => {
                    report.failed.push(SettlementFailure::NotPending { id: *id, status });
                }
                Err(TransitionError::NotLapsed { .. }) => {
                    unreachable!("only expiry checks for a lapsed hold")
                }
            }
        }

        if !targets.is_empty() {
            let event = Event::ReservationsSettled {
                transition,
                at: now,
                targets,
            };
            self.persist_and_apply_all(guards.values_mut(), &event).await?;
            let label = match transition {
                Transition::Confirm => "confirm",
                Transition::Cancel => "cancel",
                Transition::Expire => "expire",
            };
            metrics::counter!(crate::observability::SETTLEMENTS_TOTAL, "transition" => label)
                .increment(report.applied.len() as u64);
            info!(
                "{label}: {} applied, {} refused for user {user_id}",
                report.applied.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }
}
