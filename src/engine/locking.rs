use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tokio::time::Instant;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

pub type ProductGuard = OwnedRwLockWriteGuard<ProductState>;
pub type CartGuard = OwnedRwLockWriteGuard<CartState>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

fn busy() -> EngineError {
    metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
    EngineError::ResourceBusy
}

pub(super) async fn write_within<T>(
    lock: Arc<RwLock<T>>,
    limit: Duration,
) -> Result<OwnedRwLockWriteGuard<T>, EngineError> {
    tokio::time::timeout(limit, lock.write_owned())
        .await
        .map_err(|_| busy())
}

pub(super) async fn read_within<T>(
    lock: Arc<RwLock<T>>,
    limit: Duration,
) -> Result<OwnedRwLockReadGuard<T>, EngineError> {
    tokio::time::timeout(limit, lock.read_owned())
        .await
        .map_err(|_| busy())
}

impl Engine {
    /// Per-acquisition budget: `lock_timeout`, shortened to whatever is left
    /// before `deadline`.
    fn budget(&self, deadline: Option<Instant>) -> Result<Duration, EngineError> {
        let limit = self.config.lock_timeout;
        match deadline {
            None => Ok(limit),
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(busy());
                }
                Ok(left.min(limit))
            }
        }
    }

    /// Entry ticket for any state change. Taken before every other lock.
    pub(super) async fn commit_permit(
        &self,
        deadline: Option<Instant>,
    ) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        tokio::time::timeout(self.budget(deadline)?, self.commit_gate.read())
            .await
            .map_err(|_| busy())
    }

    pub(super) async fn lock_cart(
        &self,
        user_id: Ulid,
        deadline: Option<Instant>,
    ) -> Result<CartGuard, EngineError> {
        let cart = self
            .carts
            .entry(user_id)
            .or_insert_with(|| Arc::new(RwLock::new(CartState::new(user_id))))
            .value()
            .clone();
        write_within(cart, self.budget(deadline)?).await
    }

    /// Write-lock one product. Fails with `NotFound` if the product was
    /// deleted while we waited.
    pub(super) async fn lock_product(
        &self,
        id: Ulid,
        deadline: Option<Instant>,
    ) -> Result<ProductGuard, EngineError> {
        let arc = self.get_product_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = write_within(arc.clone(), self.budget(deadline)?).await?;
        if !self.is_live(&id, &arc) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    /// Write-lock a set of products in ascending id order. Unknown products
    /// are left out of the result; the caller decides what that means.
    pub(super) async fn lock_products(
        &self,
        ids: &BTreeSet<Ulid>,
        deadline: Option<Instant>,
    ) -> Result<BTreeMap<Ulid, ProductGuard>, EngineError> {
        let mut guards = BTreeMap::new();
        for id in ids {
            let Some(arc) = self.get_product_state(id) else {
                continue;
            };
            let guard = write_within(arc.clone(), self.budget(deadline)?).await?;
            if self.is_live(id, &arc) {
                guards.insert(*id, guard);
            }
        }
        Ok(guards)
    }

    pub(super) async fn read_product(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<ProductState>, EngineError> {
        let arc = self.get_product_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = read_within(arc.clone(), self.config.lock_timeout).await?;
        if !self.is_live(&id, &arc) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    /// The map still points at this exact state (not deleted, not recreated).
    fn is_live(&self, id: &Ulid, arc: &Arc<RwLock<ProductState>>) -> bool {
        self.products
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), arc))
    }
}
