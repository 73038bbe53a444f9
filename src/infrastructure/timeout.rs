use crate::domain::ids::{MovementId, NegotiationId, TripId, UserId};
use crate::domain::money::Money;
use crate::domain::movement::{BalanceDelta, MoneyMovement, MovementSlot, MovementState};
use crate::domain::negotiation::{NegotiationRecord, OfferOutcome};
use crate::domain::ports::{MoneyStore, TripStore};
use crate::domain::trip::{Trip, TripStatus};
use crate::error::{Result, TripError};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounds every call to the wrapped store. A call that outlives the limit
/// fails with `StoreUnavailable` instead of hanging the caller.
#[derive(Clone)]
pub struct TimeoutStore<S> {
    inner: S,
    limit: Duration,
}

impl<S> TimeoutStore<S> {
    pub fn new(inner: S, limit: Duration) -> Self {
        Self { inner, limit }
    }

    async fn bounded<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, limit_ms = self.limit.as_millis() as u64, "ledger store call timed out");
                Err(TripError::StoreUnavailable(format!(
                    "{op} exceeded {}ms",
                    self.limit.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl<S: TripStore> TripStore for TimeoutStore<S> {
    async fn insert_trip(&self, trip: Trip) -> Result<()> {
        self.bounded("insert_trip", self.inner.insert_trip(trip)).await
    }

    async fn load_trip(&self, id: TripId) -> Result<Option<Trip>> {
        self.bounded("load_trip", self.inner.load_trip(id)).await
    }

    async fn all_trips(&self) -> Result<Vec<Trip>> {
        self.bounded("all_trips", self.inner.all_trips()).await
    }

    async fn save_trip_if(&self, trip: &Trip, expected: TripStatus) -> Result<Option<Trip>> {
        self.bounded("save_trip_if", self.inner.save_trip_if(trip, expected))
            .await
    }

    async fn increment_boarded_if(&self, id: TripId, count: u32) -> Result<Option<Trip>> {
        self.bounded(
            "increment_boarded_if",
            self.inner.increment_boarded_if(id, count),
        )
        .await
    }

    async fn negotiations(&self, trip_id: TripId) -> Result<Vec<NegotiationRecord>> {
        self.bounded("negotiations", self.inner.negotiations(trip_id))
            .await
    }

    async fn append_negotiation(
        &self,
        record: NegotiationRecord,
        expected_newest: Option<NegotiationId>,
    ) -> Result<Option<NegotiationRecord>> {
        self.bounded(
            "append_negotiation",
            self.inner.append_negotiation(record, expected_newest),
        )
        .await
    }

    async fn resolve_negotiation_if(
        &self,
        trip_id: TripId,
        record_id: NegotiationId,
        outcome: OfferOutcome,
    ) -> Result<bool> {
        self.bounded(
            "resolve_negotiation_if",
            self.inner.resolve_negotiation_if(trip_id, record_id, outcome),
        )
        .await
    }
}

#[async_trait]
impl<S: MoneyStore> MoneyStore for TimeoutStore<S> {
    async fn open_movement_unique(
        &self,
        movement: MoneyMovement,
        delta: Option<BalanceDelta>,
    ) -> Result<MovementSlot> {
        self.bounded(
            "open_movement_unique",
            self.inner.open_movement_unique(movement, delta),
        )
        .await
    }

    async fn insert_movement(
        &self,
        movement: MoneyMovement,
        delta: Option<BalanceDelta>,
    ) -> Result<()> {
        self.bounded("insert_movement", self.inner.insert_movement(movement, delta))
            .await
    }

    async fn load_movement(&self, id: MovementId) -> Result<Option<MoneyMovement>> {
        self.bounded("load_movement", self.inner.load_movement(id))
            .await
    }

    async fn load_movement_by_ref(&self, reference: &str) -> Result<Option<MoneyMovement>> {
        self.bounded(
            "load_movement_by_ref",
            self.inner.load_movement_by_ref(reference),
        )
        .await
    }

    async fn movements_for_trip(&self, trip_id: TripId) -> Result<Vec<MoneyMovement>> {
        self.bounded("movements_for_trip", self.inner.movements_for_trip(trip_id))
            .await
    }

    async fn attach_reference(&self, id: MovementId, reference: &str) -> Result<bool> {
        self.bounded(
            "attach_reference",
            self.inner.attach_reference(id, reference),
        )
        .await
    }

    async fn settle_movement_if(
        &self,
        id: MovementId,
        expected: MovementState,
        next: MovementState,
        delta: Option<BalanceDelta>,
    ) -> Result<bool> {
        self.bounded(
            "settle_movement_if",
            self.inner.settle_movement_if(id, expected, next, delta),
        )
        .await
    }

    async fn balance(&self, account: &UserId) -> Result<Money> {
        self.bounded("balance", self.inner.balance(account)).await
    }

    async fn adjust_balance(&self, account: &UserId, delta: Money) -> Result<Money> {
        self.bounded("adjust_balance", self.inner.adjust_balance(account, delta))
            .await
    }

    async fn balances(&self) -> Result<Vec<(UserId, Money)>> {
        self.bounded("balances", self.inner.balances()).await
    }
}
