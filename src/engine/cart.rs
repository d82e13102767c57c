use ulid::Ulid;

use crate::audit::{CartAction, CartAuditEntry};
use crate::limits::*;
use crate::model::*;

use super::locking::{now_ms, read_within};
use super::{Engine, EngineError};

fn check_quantity(quantity: u32) -> Result<(), EngineError> {
    if quantity == 0 || quantity > MAX_CART_QUANTITY {
        return Err(EngineError::InvalidQuantity(quantity));
    }
    Ok(())
}

impl Engine {
    /// Available stock and current price of a product, read under its lock.
    /// Purely advisory: nothing is held once this returns.
    async fn stock_snapshot(&self, product_id: Ulid) -> Result<(u32, u64), EngineError> {
        let ps = self.read_product(product_id).await?;
        Ok((ps.ledger.available(), ps.unit_price))
    }

    /// Add `quantity` units of a product to the user's cart. An existing line
    /// is incremented and keeps the price it was first added at.
    pub async fn add_to_cart(
        &self,
        user_id: Ulid,
        product_id: Ulid,
        quantity: u32,
    ) -> Result<CartView, EngineError> {
        check_quantity(quantity)?;
        let _permit = self.commit_permit(None).await?;
        let mut cart = self.lock_cart(user_id, None).await?;
        let (available, price) = self.stock_snapshot(product_id).await?;

        let existing = cart.lines.get(&product_id).cloned();
        let before = existing.as_ref().map_or(0, |l| l.quantity);
        let after = before.saturating_add(quantity);
        check_quantity(after)?;
        if existing.is_none() && cart.lines.len() >= MAX_CART_LINES {
            return Err(EngineError::LimitExceeded("too many cart lines"));
        }
        if available < after {
            return Err(EngineError::InsufficientStock {
                product_id,
                available,
                requested: after,
            });
        }
        let unit_price = existing.map_or(price, |l| l.unit_price);

        let event = Event::CartItemSet {
            user_id,
            product_id,
            quantity: after,
            unit_price,
        };
        self.persist_cart(&mut cart, &event).await?;
        self.record_audit(CartAuditEntry {
            user_id,
            action: CartAction::Add,
            product_id: Some(product_id),
            quantity_before: before,
            quantity_after: after,
            unit_price: Some(unit_price),
            at: now_ms(),
        })
        .await;
        Ok(cart.view())
    }

    /// Set the quantity of a line already in the cart.
    pub async fn update_cart_item(
        &self,
        user_id: Ulid,
        product_id: Ulid,
        quantity: u32,
    ) -> Result<CartView, EngineError> {
        check_quantity(quantity)?;
        let _permit = self.commit_permit(None).await?;
        let mut cart = self.lock_cart(user_id, None).await?;
        let line = cart
            .lines
            .get(&product_id)
            .cloned()
            .ok_or(EngineError::NotFound(product_id))?;
        let (available, _) = self.stock_snapshot(product_id).await?;
        if available < quantity {
            return Err(EngineError::InsufficientStock {
                product_id,
                available,
                requested: quantity,
            });
        }

        let event = Event::CartItemSet {
            user_id,
            product_id,
            quantity,
            unit_price: line.unit_price,
        };
        self.persist_cart(&mut cart, &event).await?;
        self.record_audit(CartAuditEntry {
            user_id,
            action: CartAction::Update,
            product_id: Some(product_id),
            quantity_before: line.quantity,
            quantity_after: quantity,
            unit_price: Some(line.unit_price),
            at: now_ms(),
        })
        .await;
        Ok(cart.view())
    }

    /// Existence is checked after the cart lock is taken, so `NotFound`
    /// here means the line really is gone.
    pub async fn remove_cart_item(
        &self,
        user_id: Ulid,
        product_id: Ulid,
    ) -> Result<CartView, EngineError> {
        let _permit = self.commit_permit(None).await?;
        let mut cart = self.lock_cart(user_id, None).await?;
        let line = cart
            .lines
            .get(&product_id)
            .cloned()
            .ok_or(EngineError::NotFound(product_id))?;

        let event = Event::CartItemRemoved {
            user_id,
            product_id,
        };
        self.persist_cart(&mut cart, &event).await?;
        self.record_audit(CartAuditEntry {
            user_id,
            action: CartAction::Remove,
            product_id: Some(product_id),
            quantity_before: line.quantity,
            quantity_after: 0,
            unit_price: Some(line.unit_price),
            at: now_ms(),
        })
        .await;
        Ok(cart.view())
    }

    /// Empty the cart. Also what the logout collaborator calls.
    pub async fn clear_cart(&self, user_id: Ulid) -> Result<CartView, EngineError> {
        let _permit = self.commit_permit(None).await?;
        let mut cart = self.lock_cart(user_id, None).await?;
        if cart.is_empty() {
            return Ok(cart.view());
        }
        let before = u32::try_from(cart.total_items()).unwrap_or(u32::MAX);

        let event = Event::CartCleared { user_id };
        self.persist_cart(&mut cart, &event).await?;
        self.record_audit(CartAuditEntry {
            user_id,
            action: CartAction::Clear,
            product_id: None,
            quantity_before: before,
            quantity_after: 0,
            unit_price: None,
            at: now_ms(),
        })
        .await;
        Ok(cart.view())
    }

    /// Apply many quantity changes at once. Quantity 0 removes the line.
    /// Entries that cannot be applied are skipped and reported; the rest go through.
    pub async fn bulk_update_cart(
        &self,
        user_id: Ulid,
        updates: Vec<(Ulid, i64)>,
    ) -> Result<BulkUpdateReport, EngineError> {
        if updates.len() > MAX_CART_LINES {
            return Err(EngineError::LimitExceeded("too many cart lines"));
        }
        let _permit = self.commit_permit(None).await?;
        let mut cart = self.lock_cart(user_id, None).await?;
        let mut report = BulkUpdateReport::default();
        let skip = |report: &mut BulkUpdateReport, product_id: Ulid, reason: &str| {
            report.skipped.push(SkippedUpdate {
                product_id,
                reason: reason.to_string(),
            });
        };

        for (product_id, quantity) in updates {
            let existing = cart.lines.get(&product_id).cloned();
            let before = existing.as_ref().map_or(0, |l| l.quantity);

            if quantity == 0 {
                let Some(line) = existing else {
                    skip(&mut report, product_id, "not in cart");
                    continue;
                };
                let event = Event::CartItemRemoved {
                    user_id,
                    product_id,
                };
                self.persist_cart(&mut cart, &event).await?;
                self.record_audit(CartAuditEntry {
                    user_id,
                    action: CartAction::BulkUpdate,
                    product_id: Some(product_id),
                    quantity_before: before,
                    quantity_after: 0,
                    unit_price: Some(line.unit_price),
                    at: now_ms(),
                })
                .await;
                report.removed.push(product_id);
                continue;
            }

            let quantity = match u32::try_from(quantity) {
                Ok(q) if q <= MAX_CART_QUANTITY => q,
                _ => {
                    skip(&mut report, product_id, "invalid quantity");
                    continue;
                }
            };
            if existing.is_none() && cart.lines.len() >= MAX_CART_LINES {
                skip(&mut report, product_id, "too many cart lines");
                continue;
            }
            let (available, price) = match self.stock_snapshot(product_id).await {
                Ok(snapshot) => snapshot,
                Err(EngineError::NotFound(_)) => {
                    skip(&mut report, product_id, "unknown product");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if available < quantity {
                skip(&mut report, product_id, "insufficient stock");
                continue;
            }
            if before == quantity {
                continue;
            }

            let unit_price = existing.map_or(price, |l| l.unit_price);
            let event = Event::CartItemSet {
                user_id,
                product_id,
                quantity,
                unit_price,
            };
            self.persist_cart(&mut cart, &event).await?;
            self.record_audit(CartAuditEntry {
                user_id,
                action: CartAction::BulkUpdate,
                product_id: Some(product_id),
                quantity_before: before,
                quantity_after: quantity,
                unit_price: Some(unit_price),
                at: now_ms(),
            })
            .await;
            report.updated.push(product_id);
        }

        report.cart = Some(cart.view());
        Ok(report)
    }

    pub async fn get_cart(&self, user_id: Ulid) -> Result<CartView, EngineError> {
        let Some(cart) = self.carts.get(&user_id).map(|e| e.value().clone()) else {
            return Ok(CartState::new(user_id).view());
        };
        let guard = read_within(cart, self.config.lock_timeout).await?;
        Ok(guard.view())
    }
}
