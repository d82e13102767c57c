use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::locking::{now_ms, write_within};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        self.compact_wal_at(now_ms()).await
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Settled reservations older than the retention window are
    /// dropped from the log and from memory.
    pub async fn compact_wal_at(&self, now: Ms) -> Result<(), EngineError> {
        // No mutation is in flight while the gate is held exclusively, so the
        // snapshot and the log agree.
        let _gate = tokio::time::timeout(self.config.lock_timeout, self.commit_gate.write())
            .await
            .map_err(|_| EngineError::ResourceBusy)?;
        let cutoff = now.saturating_sub(self.config.retention_ms);

        let mut product_states: Vec<(Ulid, _)> = self
            .products
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        product_states.sort_by_key(|(id, _)| *id);

        let mut events = Vec::new();
        let mut guards = Vec::with_capacity(product_states.len());
        let mut dropped = 0usize;
        for (_, state) in product_states {
            let guard = write_within(state, self.config.lock_timeout).await?;
            events.push(Event::ProductRestored {
                id: guard.id,
                name: guard.name.clone(),
                unit_price: guard.unit_price,
                stock_total: guard.ledger.total(),
                stock_reserved: guard.ledger.reserved(),
                stock_sold: guard.ledger.sold(),
            });
            for r in guard.reservations.values() {
                if r.settled_at().is_some_and(|at| at < cutoff) {
                    dropped += 1;
                    continue;
                }
                events.push(Event::ReservationRestored {
                    reservation: r.clone(),
                });
            }
            guards.push(guard);
        }

        let mut cart_states: Vec<(Ulid, _)> = self
            .carts
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        cart_states.sort_by_key(|(id, _)| *id);
        for (user_id, state) in cart_states {
            let cart = write_within(state, self.config.lock_timeout).await?;
            for line in cart.lines.values() {
                events.push(Event::CartItemSet {
                    user_id,
                    product_id: line.product_id,
                    quantity: line.quantity,
                    unit_price: line.unit_price,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        if dropped > 0 {
            for guard in &mut guards {
                let expired: Vec<Ulid> = guard
                    .reservations
                    .values()
                    .filter(|r| r.settled_at().is_some_and(|at| at < cutoff))
                    .map(|r| r.id)
                    .collect();
                for id in expired {
                    guard.reservations.remove(&id);
                    self.index.remove(&id);
                }
            }
        }
        info!("WAL compacted to {count} events, {dropped} settled reservations retired");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
