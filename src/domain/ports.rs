use super::events::TripEvent;
use super::ids::{MovementId, NegotiationId, TripId, UserId};
use super::money::Money;
use super::movement::{BalanceDelta, MoneyMovement, MovementSlot, MovementState};
use super::negotiation::{NegotiationRecord, OfferOutcome};
use super::trip::{Trip, TripStatus};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Durable storage for trips and their negotiation log.
///
/// Every mutation is conditional: implementations must apply the check and
/// the write as one atomic step, the way `UPDATE ... WHERE id = ? AND
/// status = ?` does in a relational store.
#[async_trait]
pub trait TripStore: Send + Sync {
    /// Fails with `Conflict` if a trip with the same id exists.
    async fn insert_trip(&self, trip: Trip) -> Result<()>;

    async fn load_trip(&self, id: TripId) -> Result<Option<Trip>>;

    async fn all_trips(&self) -> Result<Vec<Trip>>;

    /// Writes `trip` only if the stored row still has status `expected` and
    /// the same `version` as `trip`. Returns the stored trip with its version
    /// bumped, or `None` if the condition no longer holds.
    async fn save_trip_if(&self, trip: &Trip, expected: TripStatus) -> Result<Option<Trip>>;

    /// Adds `count` boarded passengers while the trip is `Arrived` and the
    /// new count stays within `total_passengers`. Returns `None` otherwise.
    async fn increment_boarded_if(&self, id: TripId, count: u32) -> Result<Option<Trip>>;

    /// The trip's negotiation log, oldest first.
    async fn negotiations(&self, trip_id: TripId) -> Result<Vec<NegotiationRecord>>;

    /// Appends `record` if the newest record is still `expected_newest`.
    /// A pending newest record is marked `Superseded` in the same step.
    /// Returns the stored record with its `seq`, or `None` if another
    /// record was appended first.
    async fn append_negotiation(
        &self,
        record: NegotiationRecord,
        expected_newest: Option<NegotiationId>,
    ) -> Result<Option<NegotiationRecord>>;

    /// Sets the outcome of `record_id` if it is the trip's newest record
    /// and still `Pending`.
    async fn resolve_negotiation_if(
        &self,
        trip_id: TripId,
        record_id: NegotiationId,
        outcome: OfferOutcome,
    ) -> Result<bool>;
}

/// Durable storage for money movements and provider balances.
#[async_trait]
pub trait MoneyStore: Send + Sync {
    /// Stores `movement` unless another movement already holds the trip's
    /// slot for its direction (see `Direction::holds_trip_slot`). `delta`
    /// is applied only when the movement is stored.
    async fn open_movement_unique(
        &self,
        movement: MoneyMovement,
        delta: Option<BalanceDelta>,
    ) -> Result<MovementSlot>;

    /// Stores `movement` and applies `delta` together. A debit that would
    /// take the balance below zero fails with `InsufficientFunds` and
    /// stores nothing.
    async fn insert_movement(
        &self,
        movement: MoneyMovement,
        delta: Option<BalanceDelta>,
    ) -> Result<()>;

    async fn load_movement(&self, id: MovementId) -> Result<Option<MoneyMovement>>;

    async fn load_movement_by_ref(&self, reference: &str) -> Result<Option<MoneyMovement>>;

    async fn movements_for_trip(&self, trip_id: TripId) -> Result<Vec<MoneyMovement>>;

    /// Records the gateway reference on a movement that has none yet.
    /// References are unique across movements (`Conflict` on reuse).
    async fn attach_reference(&self, id: MovementId, reference: &str) -> Result<bool>;

    /// Moves a movement from `expected` to `next` and applies `delta` in the
    /// same atomic step. Returns `false`, with nothing applied, if the
    /// movement is no longer in `expected`.
    async fn settle_movement_if(
        &self,
        id: MovementId,
        expected: MovementState,
        next: MovementState,
        delta: Option<BalanceDelta>,
    ) -> Result<bool>;

    async fn balance(&self, account: &UserId) -> Result<Money>;

    /// Linearizable per-account increment. Returns the new balance.
    async fn adjust_balance(&self, account: &UserId, delta: Money) -> Result<Money>;

    async fn balances(&self) -> Result<Vec<(UserId, Money)>>;
}

/// Status of a charge or payout as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Success,
    Pending,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub status: GatewayStatus,
    pub amount: Option<Money>,
}

/// Mobile-money gateway adapter.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Starts a charge against the payer. Returns the gateway reference.
    async fn initiate_collection(&self, payer_contact: &str, amount: Money) -> Result<String>;

    async fn initiate_payout(&self, payee_contact: &str, amount: Money) -> Result<String>;

    async fn verify(&self, external_ref: &str) -> Result<Verification>;
}

/// Best-effort publish of trip events, keyed by user id.
///
/// Implementations must not block and must swallow their own failures.
pub trait Notifier: Send + Sync {
    fn publish(&self, topic: &UserId, event: TripEvent);
}

pub type TripStoreHandle = Arc<dyn TripStore>;
pub type MoneyStoreHandle = Arc<dyn MoneyStore>;
pub type GatewayHandle = Arc<dyn PaymentGateway>;
pub type NotifierHandle = Arc<dyn Notifier>;
