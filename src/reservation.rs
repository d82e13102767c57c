use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::ledger::StockLedger;
use crate::model::Ms;

/// Default hold duration for a checkout.
pub const DEFAULT_TTL_MS: Ms = 15 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only ways out of `Pending`. There is no way back in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    /// Payment succeeded: reserved → sold.
    Confirm,
    /// Payment failed, user aborted, or checkout rollback: reserved → available.
    Cancel,
    /// TTL elapsed (sweeper only): reserved → available.
    Expire,
}

impl Transition {
    pub fn target(self) -> ReservationStatus {
        match self {
            Transition::Confirm => ReservationStatus::Confirmed,
            Transition::Cancel => ReservationStatus::Cancelled,
            Transition::Expire => ReservationStatus::Expired,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    NotPending(ReservationStatus),
    /// Confirmation arrived after `expires_at`.
    Lapsed { expires_at: Ms },
    /// Expiry attempted while the hold is still live.
    NotLapsed { expires_at: Ms },
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionError::NotPending(status) => write!(f, "reservation is {status}"),
            TransitionError::Lapsed { expires_at } => {
                write!(f, "reservation expired at {expires_at}")
            }
            TransitionError::NotLapsed { expires_at } => {
                write!(f, "reservation is held until {expires_at}")
            }
        }
    }
}

impl std::error::Error for TransitionError {}

/// A provisional claim on `quantity` units of one product by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub product_id: Ulid,
    pub quantity: u32,
    status: ReservationStatus,
    pub created_at: Ms,
    pub expires_at: Ms,
    confirmed_at: Option<Ms>,
    cancelled_at: Option<Ms>,
}

impl Reservation {
    pub fn pending(
        id: Ulid,
        user_id: Ulid,
        product_id: Ulid,
        quantity: u32,
        created_at: Ms,
        ttl_ms: Ms,
    ) -> Self {
        Self {
            id,
            user_id,
            product_id,
            quantity,
            status: ReservationStatus::Pending,
            created_at,
            expires_at: created_at + ttl_ms,
            confirmed_at: None,
            cancelled_at: None,
        }
    }

    pub fn status(&self) -> ReservationStatus {
        self.status
    }

    pub fn is_pending(&self) -> bool {
        self.status == ReservationStatus::Pending
    }

    /// Strictly past `expires_at`; at `expires_at` itself the hold is still live.
    pub fn is_lapsed(&self, now: Ms) -> bool {
        now > self.expires_at
    }

    pub fn confirmed_at(&self) -> Option<Ms> {
        self.confirmed_at
    }

    /// Set on cancellation and on expiry.
    pub fn cancelled_at(&self) -> Option<Ms> {
        self.cancelled_at
    }

    /// Terminal timestamp, if any.
    pub fn settled_at(&self) -> Option<Ms> {
        self.confirmed_at.or(self.cancelled_at)
    }

    pub fn check(&self, transition: Transition, now: Ms) -> Result<(), TransitionError> {
        if self.status != ReservationStatus::Pending {
            return Err(TransitionError::NotPending(self.status));
        }
        match transition {
            Transition::Confirm if self.is_lapsed(now) => Err(TransitionError::Lapsed {
                expires_at: self.expires_at,
            }),
            Transition::Expire if !self.is_lapsed(now) => Err(TransitionError::NotLapsed {
                expires_at: self.expires_at,
            }),
            _ => Ok(()),
        }
    }

    /// Move to a terminal state and apply the paired ledger effect.
    ///
    /// Both halves happen here or neither does: on a guard failure nothing is
    /// touched. Ledger anomalies are reported by the ledger itself and do not
    /// undo the transition.
    pub fn settle(
        &mut self,
        transition: Transition,
        now: Ms,
        ledger: &mut StockLedger,
    ) -> Result<(), TransitionError> {
        self.check(transition, now)?;
        self.status = transition.target();
        match transition {
            Transition::Confirm => {
                self.confirmed_at = Some(now);
                let _ = ledger.commit(self.quantity);
            }
            Transition::Cancel | Transition::Expire => {
                self.cancelled_at = Some(now);
                let _ = ledger.release(self.quantity);
            }
        }
        Ok(())
    }
}
