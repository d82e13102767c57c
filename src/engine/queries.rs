use ulid::Ulid;

use crate::reservation::Reservation;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let owner = self.index.locate(&id).ok_or(EngineError::NotFound(id))?;
        let ps = self.read_product(owner.product_id).await?;
        ps.reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Every reservation the user has made (any status), oldest first.
    pub async fn reservations_for_user(&self, user_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let mut out = Vec::new();
        for id in self.index.for_user(&user_id) {
            match self.get_reservation(id).await {
                Ok(r) => out.push(r),
                // Dropped by a concurrent product deletion or compaction.
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        out.sort_by_key(|r| (r.created_at, r.id));
        Ok(out)
    }

    /// Every reservation held against a product, oldest first.
    pub async fn reservations_for_product(
        &self,
        product_id: Ulid,
    ) -> Result<Vec<Reservation>, EngineError> {
        let ps = self.read_product(product_id).await?;
        let mut out: Vec<Reservation> = ps.reservations.values().cloned().collect();
        out.sort_by_key(|r| (r.created_at, r.id));
        Ok(out)
    }
}
