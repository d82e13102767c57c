use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::ledger::LedgerError;
use crate::limits::*;
use crate::model::*;

use super::locking::read_within;
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_product(
        &self,
        id: Ulid,
        name: Option<String>,
        unit_price: u64,
        stock_total: u32,
    ) -> Result<ProductInfo, EngineError> {
        if self.products.len() >= MAX_PRODUCTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many products"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("product name too long"));
        }
        if stock_total > MAX_STOCK_TOTAL {
            return Err(EngineError::LimitExceeded("stock total too large"));
        }
        let _permit = self.commit_permit(None).await?;
        if self.products.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ProductCreated {
            id,
            name: name.clone(),
            unit_price,
            stock_total,
        };
        self.wal_append(&event).await?;
        let ps = ProductState::new(id, name, unit_price, stock_total);
        let info = ps.info();
        self.products.insert(id, Arc::new(RwLock::new(ps)));
        self.notify.publish(&event);
        Ok(info)
    }

    /// Replace a product's physical stock count. Never below `reserved + sold`.
    pub async fn adjust_stock(&self, id: Ulid, stock_total: u32) -> Result<ProductInfo, EngineError> {
        if stock_total > MAX_STOCK_TOTAL {
            return Err(EngineError::LimitExceeded("stock total too large"));
        }
        let _permit = self.commit_permit(None).await?;
        let mut guard = self.lock_product(id, None).await?;

        // Validate against a copy; the live ledger only changes through the event.
        let mut probe = guard.ledger;
        probe.set_total(stock_total).map_err(|e| match e {
            LedgerError::StockBelowCommitted {
                requested_total,
                committed,
            } => EngineError::StockBelowCommitted {
                product_id: id,
                requested_total,
                committed,
            },
            _ => EngineError::LimitExceeded("invalid stock total"),
        })?;

        let event = Event::StockAdjusted { id, stock_total };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("product {id}: stock total set to {stock_total}");
        Ok(guard.info())
    }

    /// Remove a product. Refused while any reservation against it is pending;
    /// its settled reservation history goes with it.
    pub async fn delete_product(&self, id: Ulid) -> Result<(), EngineError> {
        let _permit = self.commit_permit(None).await?;
        let guard = self.lock_product(id, None).await?;
        if guard.has_pending() {
            return Err(EngineError::HasActiveReservations(id));
        }

        let event = Event::ProductDeleted { id };
        self.wal_append(&event).await?;
        for rid in guard.reservations.keys() {
            self.index.remove(rid);
        }
        self.products.remove(&id);
        drop(guard);
        self.notify.publish(&event);
        self.notify.remove(&id);
        Ok(())
    }

    pub async fn get_product(&self, id: Ulid) -> Result<ProductInfo, EngineError> {
        Ok(self.read_product(id).await?.info())
    }

    /// All products, ordered by id.
    pub async fn list_products(&self) -> Result<Vec<ProductInfo>, EngineError> {
        let mut states: Vec<(Ulid, _)> = self
            .products
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        states.sort_by_key(|(id, _)| *id);

        let mut out = Vec::with_capacity(states.len());
        for (_, state) in states {
            let guard = read_within(state, self.config.lock_timeout).await?;
            out.push(guard.info());
        }
        Ok(out)
    }
}
