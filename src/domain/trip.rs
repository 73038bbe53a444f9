//! Trip aggregate and the per-kind execution state machine.

use super::ids::{TripId, UserId};
use super::money::Money;
use crate::error::{Result, TripError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripKind {
    SharedRide,
    ExclusiveHire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Requested,
    Approved,
    // shared ride
    Inbound,
    Arrived,
    Boarded,
    InProgress,
    PaymentDue,
    // exclusive hire
    AwaitingPaymentChoice,
    Scheduled,
    HandoverPending,
    Active,
    ReturnPending,

    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    Proposed,
    Negotiating,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Unbilled,
    AwaitingPayment,
    Paid,
    Failed,
    Refunded,
}

/// When the requester of an exclusive hire settles the price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentTiming {
    Now,
    AtPickup,
}

const SHARED_RIDE_PATH: &[TripStatus] = &[
    TripStatus::Requested,
    TripStatus::Approved,
    TripStatus::Inbound,
    TripStatus::Arrived,
    TripStatus::Boarded,
    TripStatus::InProgress,
    TripStatus::PaymentDue,
    TripStatus::Completed,
];

const EXCLUSIVE_HIRE_PATH: &[TripStatus] = &[
    TripStatus::Requested,
    TripStatus::Approved,
    TripStatus::AwaitingPaymentChoice,
    TripStatus::Scheduled,
    TripStatus::HandoverPending,
    TripStatus::Active,
    TripStatus::ReturnPending,
    TripStatus::Completed,
];

impl TripKind {
    /// The ordered execution path for this kind, excluding cancellation.
    pub fn path(self) -> &'static [TripStatus] {
        match self {
            Self::SharedRide => SHARED_RIDE_PATH,
            Self::ExclusiveHire => EXCLUSIVE_HIRE_PATH,
        }
    }

    pub fn position(self, status: TripStatus) -> Option<usize> {
        self.path().iter().position(|s| *s == status)
    }

    /// Whether `from -> to` is an edge of this kind's state machine.
    ///
    /// Edges follow the path one step at a time. The single skip is the
    /// hire short-circuit `Scheduled -> Active` for trips paid upfront.
    pub fn permits(self, from: TripStatus, to: TripStatus) -> bool {
        if to == TripStatus::Cancelled {
            return from.is_cancellable();
        }
        if self == Self::ExclusiveHire
            && from == TripStatus::Scheduled
            && to == TripStatus::Active
        {
            return true;
        }
        match (self.position(from), self.position(to)) {
            (Some(f), Some(t)) => t == f + 1,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SharedRide => "shared_ride",
            Self::ExclusiveHire => "exclusive_hire",
        }
    }
}

impl TripStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Cancellation is allowed until the trip is physically under way.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::Requested
                | Self::Approved
                | Self::Inbound
                | Self::Arrived
                | Self::Boarded
                | Self::AwaitingPaymentChoice
                | Self::Scheduled
                | Self::HandoverPending
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Approved => "approved",
            Self::Inbound => "inbound",
            Self::Arrived => "arrived",
            Self::Boarded => "boarded",
            Self::InProgress => "in_progress",
            Self::PaymentDue => "payment_due",
            Self::AwaitingPaymentChoice => "awaiting_payment_choice",
            Self::Scheduled => "scheduled",
            Self::HandoverPending => "handover_pending",
            Self::Active => "active",
            Self::ReturnPending => "return_pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NegotiationStatus {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Proposed | Self::Negotiating)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Negotiating => "negotiating",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl PaymentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unbilled => "unbilled",
            Self::AwaitingPayment => "awaiting_payment",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }
}

/// Input for creating a trip. Unknown fields are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct NewTrip {
    pub kind: TripKind,
    pub requester_id: UserId,
    #[serde(default)]
    pub provider_id: Option<UserId>,
    pub initial_price: Money,
    #[serde(default)]
    pub total_passengers: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Which side of the trip an actor is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Requester,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub kind: TripKind,
    pub requester_id: UserId,
    pub provider_id: Option<UserId>,
    pub initial_price: Money,
    pub offered_price: Option<Money>,
    pub agreed_price: Option<Money>,
    pub status: TripStatus,
    pub negotiation_status: NegotiationStatus,
    pub payment_state: PaymentState,
    pub payment_timing: Option<PaymentTiming>,
    pub total_passengers: u32,
    pub boarded_count: u32,
    /// Bumped by the store on every conditional write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Trip {
    pub fn new(input: NewTrip) -> Result<Self> {
        if !input.initial_price.is_positive() {
            return Err(TripError::Validation(
                "initial price must be positive".to_string(),
            ));
        }
        let total_passengers = input.total_passengers.unwrap_or(1);
        if total_passengers == 0 {
            return Err(TripError::Validation(
                "a trip needs at least one passenger".to_string(),
            ));
        }
        if input.provider_id.as_ref() == Some(&input.requester_id) {
            return Err(TripError::Validation(
                "requester cannot be their own provider".to_string(),
            ));
        }

        Ok(Self {
            id: TripId::new(),
            kind: input.kind,
            requester_id: input.requester_id,
            provider_id: input.provider_id,
            initial_price: input.initial_price,
            offered_price: Some(input.initial_price),
            agreed_price: None,
            status: TripStatus::Requested,
            negotiation_status: NegotiationStatus::Proposed,
            payment_state: PaymentState::Unbilled,
            payment_timing: None,
            total_passengers,
            boarded_count: 0,
            version: 0,
            created_at: Utc::now(),
            approved_at: None,
            completed_at: None,
        })
    }

    pub fn party_of(&self, actor: &UserId) -> Option<Party> {
        if *actor == self.requester_id {
            Some(Party::Requester)
        } else if self.provider_id.as_ref() == Some(actor) {
            Some(Party::Provider)
        } else {
            None
        }
    }

    pub fn require_requester(&self, actor: &UserId, action: &'static str) -> Result<()> {
        match self.party_of(actor) {
            Some(Party::Requester) => Ok(()),
            _ => Err(TripError::forbidden(actor, action)),
        }
    }

    pub fn require_provider(&self, actor: &UserId, action: &'static str) -> Result<()> {
        match self.party_of(actor) {
            Some(Party::Provider) => Ok(()),
            _ => Err(TripError::forbidden(actor, action)),
        }
    }

    pub fn require_kind(&self, kind: TripKind, action: &'static str) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(TripError::Validation(format!(
                "{action} is not available for {} trips",
                self.kind.as_str()
            )))
        }
    }

    /// The price a collection is opened for.
    pub fn billable_amount(&self) -> Result<Money> {
        self.agreed_price.ok_or_else(|| {
            TripError::Conflict(format!("trip {} has no agreed price", self.id))
        })
    }

    pub fn provider(&self) -> Result<&UserId> {
        self.provider_id.as_ref().ok_or_else(|| {
            TripError::Conflict(format!("trip {} has no assigned provider", self.id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_ride() -> NewTrip {
        NewTrip {
            kind: TripKind::SharedRide,
            requester_id: UserId::from("rider"),
            provider_id: None,
            initial_price: Money(1000),
            total_passengers: Some(2),
            message: None,
        }
    }

    #[test]
    fn test_new_trip_defaults() {
        let trip = Trip::new(new_ride()).unwrap();
        assert_eq!(trip.status, TripStatus::Requested);
        assert_eq!(trip.negotiation_status, NegotiationStatus::Proposed);
        assert_eq!(trip.payment_state, PaymentState::Unbilled);
        assert_eq!(trip.offered_price, Some(Money(1000)));
        assert_eq!(trip.total_passengers, 2);
        assert_eq!(trip.version, 0);
    }

    #[test]
    fn test_new_trip_validation() {
        let mut input = new_ride();
        input.initial_price = Money(0);
        assert!(matches!(Trip::new(input), Err(TripError::Validation(_))));

        let mut input = new_ride();
        input.total_passengers = Some(0);
        assert!(matches!(Trip::new(input), Err(TripError::Validation(_))));

        let mut input = new_ride();
        input.provider_id = Some(UserId::from("rider"));
        assert!(matches!(Trip::new(input), Err(TripError::Validation(_))));
    }

    #[test]
    fn test_new_trip_rejects_unknown_fields() {
        let body = r#"{"kind":"shared_ride","requesterId":"r","initialPrice":500,"isAdmin":true}"#;
        assert!(serde_json::from_str::<NewTrip>(body).is_err());

        let body = r#"{"kind":"exclusive_hire","requesterId":"r","providerId":"p","initialPrice":500}"#;
        let input: NewTrip = serde_json::from_str(body).unwrap();
        assert_eq!(input.provider_id, Some(UserId::from("p")));
    }

    #[test]
    fn test_shared_ride_edges() {
        let kind = TripKind::SharedRide;
        assert!(kind.permits(TripStatus::Requested, TripStatus::Approved));
        assert!(kind.permits(TripStatus::InProgress, TripStatus::PaymentDue));
        assert!(kind.permits(TripStatus::PaymentDue, TripStatus::Completed));
        assert!(!kind.permits(TripStatus::Approved, TripStatus::Arrived));
        assert!(!kind.permits(TripStatus::Arrived, TripStatus::Inbound));
        assert!(!kind.permits(TripStatus::Approved, TripStatus::AwaitingPaymentChoice));
    }

    #[test]
    fn test_exclusive_hire_edges() {
        let kind = TripKind::ExclusiveHire;
        assert!(kind.permits(TripStatus::Approved, TripStatus::AwaitingPaymentChoice));
        assert!(kind.permits(TripStatus::Scheduled, TripStatus::HandoverPending));
        assert!(kind.permits(TripStatus::Scheduled, TripStatus::Active));
        assert!(kind.permits(TripStatus::HandoverPending, TripStatus::Active));
        assert!(!kind.permits(TripStatus::AwaitingPaymentChoice, TripStatus::Active));
        assert!(!kind.permits(TripStatus::Active, TripStatus::Scheduled));
    }

    #[test]
    fn test_cancellation_window() {
        let kind = TripKind::SharedRide;
        assert!(kind.permits(TripStatus::Boarded, TripStatus::Cancelled));
        assert!(!kind.permits(TripStatus::InProgress, TripStatus::Cancelled));
        assert!(!kind.permits(TripStatus::PaymentDue, TripStatus::Cancelled));
        assert!(!kind.permits(TripStatus::Completed, TripStatus::Cancelled));
        assert!(!TripKind::ExclusiveHire.permits(TripStatus::Active, TripStatus::Cancelled));
    }

    #[test]
    fn test_party_checks() {
        let mut trip = Trip::new(new_ride()).unwrap();
        let rider = UserId::from("rider");
        let driver = UserId::from("driver");

        assert_eq!(trip.party_of(&rider), Some(Party::Requester));
        assert_eq!(trip.party_of(&driver), None);
        assert!(trip.require_provider(&driver, "drive").is_err());

        trip.provider_id = Some(driver.clone());
        assert_eq!(trip.party_of(&driver), Some(Party::Provider));
        assert!(trip.require_provider(&driver, "drive").is_ok());
        assert!(matches!(
            trip.require_requester(&driver, "board"),
            Err(TripError::Forbidden { .. })
        ));
    }
}
