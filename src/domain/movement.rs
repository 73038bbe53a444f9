use super::ids::{MovementId, TripId, UserId};
use super::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Payment taken from the requester.
    Collect,
    /// Withdrawal of provider balance to an off-platform account.
    Payout,
    /// Money returned to the requester of a cancelled, paid trip.
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementState {
    Pending,
    Completed,
    Failed,
}

impl MovementState {
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl Direction {
    /// Whether a movement in `state` occupies the trip's single slot for
    /// this direction. A failed collection frees the slot so the requester
    /// can pay again; a failed refund frees it once its debit is reversed.
    pub fn holds_trip_slot(self, state: MovementState) -> bool {
        match self {
            Self::Collect | Self::Refund => {
                matches!(state, MovementState::Pending | MovementState::Completed)
            }
            Self::Payout => false,
        }
    }
}

/// Outcome reported for a movement by the gateway, through either channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
}

impl Outcome {
    pub fn target_state(self) -> MovementState {
        match self {
            Self::Success => MovementState::Completed,
            Self::Failed => MovementState::Failed,
        }
    }
}

/// A single externally-settled payment attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoneyMovement {
    pub id: MovementId,
    pub trip_id: Option<TripId>,
    /// The provider whose balance this movement credits or debits.
    pub account: UserId,
    pub direction: Direction,
    pub amount: Money,
    pub external_reference: Option<String>,
    pub state: MovementState,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl MoneyMovement {
    pub fn pending(
        trip_id: Option<TripId>,
        account: UserId,
        direction: Direction,
        amount: Money,
    ) -> Self {
        Self {
            id: MovementId::new(),
            trip_id,
            account,
            direction,
            amount,
            external_reference: None,
            state: MovementState::Pending,
            created_at: Utc::now(),
            settled_at: None,
        }
    }
}

/// A balance adjustment applied atomically with a movement write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDelta {
    pub account: UserId,
    pub delta: Money,
}

impl BalanceDelta {
    pub fn credit(account: UserId, amount: Money) -> Self {
        Self {
            account,
            delta: amount,
        }
    }

    pub fn debit(account: UserId, amount: Money) -> Self {
        Self {
            account,
            delta: amount.negate(),
        }
    }
}

/// Result of trying to claim a trip's movement slot.
#[derive(Debug, Clone, PartialEq)]
pub enum MovementSlot {
    /// The movement passed in was stored.
    Opened(MoneyMovement),
    /// A pending movement already holds the slot.
    Pending(MoneyMovement),
    /// A settled movement already holds the slot.
    Settled(MoneyMovement),
}

impl MovementSlot {
    pub fn from_existing(existing: MoneyMovement) -> Self {
        if existing.state.is_settled() {
            Self::Settled(existing)
        } else {
            Self::Pending(existing)
        }
    }

    pub fn into_movement(self) -> MoneyMovement {
        match self {
            Self::Opened(m) | Self::Pending(m) | Self::Settled(m) => m,
        }
    }
}
