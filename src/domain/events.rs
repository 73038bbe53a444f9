use super::ids::{MovementId, TripId, UserId};
use super::money::Money;
use super::trip::TripStatus;
use serde::Serialize;

/// State changes published to interested parties.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TripEvent {
    OfferProposed {
        trip_id: TripId,
        by: UserId,
        price: Money,
    },
    ProviderAssigned {
        trip_id: TripId,
        provider_id: UserId,
    },
    Approved {
        trip_id: TripId,
        price: Money,
    },
    Rejected {
        trip_id: TripId,
    },
    StatusChanged {
        trip_id: TripId,
        from: TripStatus,
        to: TripStatus,
    },
    PassengersBoarded {
        trip_id: TripId,
        boarded: u32,
        total: u32,
    },
    PaymentRequested {
        trip_id: TripId,
        amount: Money,
    },
    PaymentReceived {
        trip_id: TripId,
        amount: Money,
    },
    PaymentFailed {
        trip_id: TripId,
    },
    BalanceCredited {
        trip_id: TripId,
        amount: Money,
    },
    PayoutCompleted {
        movement_id: MovementId,
        amount: Money,
    },
    PayoutFailed {
        movement_id: MovementId,
        amount: Money,
    },
    Refunded {
        trip_id: TripId,
        amount: Money,
    },
}

/// A published event together with the user it is addressed to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub topic: UserId,
    #[serde(flatten)]
    pub event: TripEvent,
}
