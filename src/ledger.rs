use tracing::error;

/// Per-product stock counters.
///
/// The counters are private: every mutation goes through `reserve`, `commit`,
/// `release` or `set_total`, and callers only ever hold a ledger behind the
/// product's write lock. After every mutation `reserved + sold <= total` holds;
/// a mutation that would break it is clamped and reported as
/// [`LedgerError::InvariantViolation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StockLedger {
    total: u32,
    reserved: u32,
    sold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    InsufficientStock { available: u32, requested: u32 },
    /// Counters were inconsistent; the operation was applied in degraded form
    /// and the counters clamped back into range.
    InvariantViolation {
        op: &'static str,
        total: u32,
        reserved: u32,
        sold: u32,
    },
    StockBelowCommitted { requested_total: u32, committed: u32 },
    ZeroQuantity,
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::InsufficientStock { available, requested } => {
                write!(f, "insufficient stock: available {available}, requested {requested}")
            }
            LedgerError::InvariantViolation { op, total, reserved, sold } => write!(
                f,
                "ledger invariant violated during {op}: total={total} reserved={reserved} sold={sold}"
            ),
            LedgerError::StockBelowCommitted { requested_total, committed } => write!(
                f,
                "stock total {requested_total} is below committed stock {committed}"
            ),
            LedgerError::ZeroQuantity => write!(f, "quantity must be positive"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl StockLedger {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            reserved: 0,
            sold: 0,
        }
    }

    /// Rebuild a ledger from persisted counters (WAL compaction snapshots).
    pub(crate) fn restore(total: u32, reserved: u32, sold: u32) -> Self {
        let mut ledger = Self { total, reserved, sold };
        let _ = ledger.enforce_invariant("restore");
        ledger
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    pub fn sold(&self) -> u32 {
        self.sold
    }

    /// `max(0, total - reserved - sold)`
    pub fn available(&self) -> u32 {
        self.total
            .saturating_sub(self.reserved)
            .saturating_sub(self.sold)
    }

    /// Hold `qty` units. Fails without touching the counters when fewer than
    /// `qty` units are available.
    pub fn reserve(&mut self, qty: u32) -> Result<(), LedgerError> {
        if qty == 0 {
            return Err(LedgerError::ZeroQuantity);
        }
        let available = self.available();
        if available < qty {
            return Err(LedgerError::InsufficientStock {
                available,
                requested: qty,
            });
        }
        self.reserved += qty;
        Ok(())
    }

    /// Move `qty` units from reserved to sold.
    ///
    /// If fewer than `qty` units are reserved the sale still goes through,
    /// reserved is clamped to 0 and the anomaly is reported.
    pub fn commit(&mut self, qty: u32) -> Result<(), LedgerError> {
        let short = self.reserved < qty;
        let before = *self;
        self.reserved = self.reserved.saturating_sub(qty);
        self.sold = self.sold.saturating_add(qty);
        let clamped = self.enforce_invariant("commit");
        if short {
            let violation = before.violation("commit");
            report(&violation);
            return Err(violation);
        }
        clamped
    }

    /// Return `qty` reserved units to the available pool, clamping at 0.
    ///
    /// Releasing with nothing reserved is a no-op. A partial over-release
    /// still clamps but is reported as an anomaly.
    pub fn release(&mut self, qty: u32) -> Result<(), LedgerError> {
        if self.reserved == 0 {
            return Ok(());
        }
        if self.reserved < qty {
            let violation = self.violation("release");
            report(&violation);
            self.reserved = 0;
            return Err(violation);
        }
        self.reserved -= qty;
        Ok(())
    }

    /// Replace the physical stock count. Never allowed to drop below what is
    /// already reserved or sold.
    pub fn set_total(&mut self, total: u32) -> Result<(), LedgerError> {
        let committed = self.reserved.saturating_add(self.sold);
        if total < committed {
            return Err(LedgerError::StockBelowCommitted {
                requested_total: total,
                committed,
            });
        }
        self.total = total;
        Ok(())
    }

    pub fn check_invariant(&self) -> Result<(), LedgerError> {
        if self.reserved.saturating_add(self.sold) > self.total {
            return Err(self.violation("check"));
        }
        Ok(())
    }

    fn enforce_invariant(&mut self, op: &'static str) -> Result<(), LedgerError> {
        if self.reserved.saturating_add(self.sold) <= self.total {
            return Ok(());
        }
        let violation = self.violation(op);
        report(&violation);
        // Sold units are final; reserved is the only counter we may shrink.
        self.reserved = self.total.saturating_sub(self.sold);
        Err(violation)
    }

    fn violation(&self, op: &'static str) -> LedgerError {
        LedgerError::InvariantViolation {
            op,
            total: self.total,
            reserved: self.reserved,
            sold: self.sold,
        }
    }
}

fn report(violation: &LedgerError) {
    error!("stock anomaly: {violation}");
    metrics::counter!(crate::observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_is_derived() {
        let mut l = StockLedger::new(10);
        assert_eq!(l.available(), 10);
        l.reserve(7).unwrap();
        assert_eq!(l.available(), 3);
        assert_eq!(l.reserved(), 7);
    }

    #[test]
    fn reserve_rejects_oversubscription_without_change() {
        let mut l = StockLedger::new(10);
        l.reserve(7).unwrap();
        let err = l.reserve(5).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                available: 3,
                requested: 5
            }
        );
        assert_eq!(l.reserved(), 7);
    }

    #[test]
    fn reserve_exactly_available() {
        let mut l = StockLedger::new(4);
        l.reserve(4).unwrap();
        assert_eq!(l.available(), 0);
        assert!(l.reserve(1).is_err());
    }

    #[test]
    fn reserve_zero_rejected() {
        let mut l = StockLedger::new(4);
        assert_eq!(l.reserve(0), Err(LedgerError::ZeroQuantity));
    }

    #[test]
    fn commit_moves_reserved_to_sold() {
        let mut l = StockLedger::new(10);
        l.reserve(6).unwrap();
        l.commit(6).unwrap();
        assert_eq!(l.reserved(), 0);
        assert_eq!(l.sold(), 6);
        assert_eq!(l.available(), 4);
        l.check_invariant().unwrap();
    }

    #[test]
    fn commit_more_than_reserved_degrades() {
        let mut l = StockLedger::new(10);
        l.reserve(2).unwrap();
        let err = l.commit(3).unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation { op: "commit", .. }));
        assert_eq!(l.reserved(), 0);
        assert_eq!(l.sold(), 3);
        l.check_invariant().unwrap();
    }

    #[test]
    fn second_release_is_a_no_op() {
        let mut l = StockLedger::new(10);
        l.reserve(2).unwrap();
        l.release(2).unwrap();
        assert_eq!(l.reserved(), 0);
        assert_eq!(l.release(2), Ok(()));
        assert_eq!(l.reserved(), 0);
        assert_eq!(l.available(), 10);
    }

    #[test]
    fn partial_over_release_clamps_at_zero() {
        let mut l = StockLedger::new(10);
        l.reserve(1).unwrap();
        let err = l.release(3).unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation { op: "release", .. }));
        assert_eq!(l.reserved(), 0);
        assert_eq!(l.available(), 10);
    }

    #[test]
    fn set_total_cannot_drop_below_committed() {
        let mut l = StockLedger::new(10);
        l.reserve(4).unwrap();
        l.commit(2).unwrap();
        assert_eq!(
            l.set_total(5),
            Err(LedgerError::StockBelowCommitted {
                requested_total: 5,
                committed: 6
            })
        );
        l.set_total(6).unwrap();
        assert_eq!(l.available(), 0);
    }

    #[test]
    fn restore_clamps_inconsistent_counters() {
        let l = StockLedger::restore(5, 4, 3);
        assert_eq!(l.sold(), 3);
        assert_eq!(l.reserved(), 2);
        l.check_invariant().unwrap();
    }
}
