use super::ids::{NegotiationId, TripId, UserId};
use super::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferOutcome {
    Pending,
    Accepted,
    Rejected,
    Superseded,
}

impl OfferOutcome {
    /// Accepted and rejected offers close the negotiation for good.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }
}

/// One entry in a trip's append-only negotiation log.
///
/// `seq` is assigned by the store on append; the highest `seq` is the
/// newest record and the only one whose outcome may still change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationRecord {
    pub id: NegotiationId,
    pub trip_id: TripId,
    pub seq: u32,
    pub proposed_by: UserId,
    pub price: Money,
    pub message: Option<String>,
    pub outcome: OfferOutcome,
    pub created_at: DateTime<Utc>,
}

impl NegotiationRecord {
    pub fn pending(
        trip_id: TripId,
        proposed_by: UserId,
        price: Money,
        message: Option<String>,
    ) -> Self {
        Self {
            id: NegotiationId::new(),
            trip_id,
            seq: 0,
            proposed_by,
            price,
            message,
            outcome: OfferOutcome::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.outcome == OfferOutcome::Pending
    }
}
