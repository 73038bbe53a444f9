use crate::domain::ids::{MovementId, NegotiationId, TripId, UserId};
use crate::domain::money::Money;
use crate::domain::movement::{BalanceDelta, MoneyMovement, MovementSlot, MovementState};
use crate::domain::negotiation::{NegotiationRecord, OfferOutcome};
use crate::domain::ports::{MoneyStore, TripStore};
use crate::domain::trip::{Trip, TripStatus};
use crate::error::{Result, TripError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for trips and negotiation logs.
///
/// Each conditional write holds the write lock across its check and its
/// update, which gives the same atomicity as a single-row conditional
/// update in a relational store.
#[derive(Default, Clone)]
pub struct InMemoryTripStore {
    trips: Arc<RwLock<HashMap<TripId, Trip>>>,
    negotiations: Arc<RwLock<HashMap<TripId, Vec<NegotiationRecord>>>>,
}

impl InMemoryTripStore {
    /// Creates a new, empty in-memory trip store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TripStore for InMemoryTripStore {
    async fn insert_trip(&self, trip: Trip) -> Result<()> {
        let mut trips = self.trips.write().await;
        if trips.contains_key(&trip.id) {
            return Err(TripError::Conflict(format!("trip {} already exists", trip.id)));
        }
        trips.insert(trip.id, trip);
        Ok(())
    }

    async fn load_trip(&self, id: TripId) -> Result<Option<Trip>> {
        let trips = self.trips.read().await;
        Ok(trips.get(&id).cloned())
    }

    async fn all_trips(&self) -> Result<Vec<Trip>> {
        let trips = self.trips.read().await;
        let mut all: Vec<Trip> = trips.values().cloned().collect();
        all.sort_by_key(|t| t.id);
        Ok(all)
    }

    async fn save_trip_if(&self, trip: &Trip, expected: TripStatus) -> Result<Option<Trip>> {
        let mut trips = self.trips.write().await;
        let Some(current) = trips.get_mut(&trip.id) else {
            return Err(TripError::not_found("trip", trip.id));
        };
        if current.status != expected || current.version != trip.version {
            return Ok(None);
        }
        let mut saved = trip.clone();
        saved.version += 1;
        *current = saved.clone();
        Ok(Some(saved))
    }

    async fn increment_boarded_if(&self, id: TripId, count: u32) -> Result<Option<Trip>> {
        let mut trips = self.trips.write().await;
        let Some(current) = trips.get_mut(&id) else {
            return Err(TripError::not_found("trip", id));
        };
        let Some(boarded) = current.boarded_count.checked_add(count) else {
            return Ok(None);
        };
        if current.status != TripStatus::Arrived || boarded > current.total_passengers {
            return Ok(None);
        }
        current.boarded_count = boarded;
        current.version += 1;
        Ok(Some(current.clone()))
    }

    async fn negotiations(&self, trip_id: TripId) -> Result<Vec<NegotiationRecord>> {
        let negotiations = self.negotiations.read().await;
        Ok(negotiations.get(&trip_id).cloned().unwrap_or_default())
    }

    async fn append_negotiation(
        &self,
        mut record: NegotiationRecord,
        expected_newest: Option<NegotiationId>,
    ) -> Result<Option<NegotiationRecord>> {
        let mut negotiations = self.negotiations.write().await;
        let log = negotiations.entry(record.trip_id).or_default();
        if log.last().map(|r| r.id) != expected_newest {
            return Ok(None);
        }
        if let Some(newest) = log.last_mut()
            && newest.is_pending()
        {
            newest.outcome = OfferOutcome::Superseded;
        }
        record.seq = log.len() as u32;
        log.push(record.clone());
        Ok(Some(record))
    }

    async fn resolve_negotiation_if(
        &self,
        trip_id: TripId,
        record_id: NegotiationId,
        outcome: OfferOutcome,
    ) -> Result<bool> {
        let mut negotiations = self.negotiations.write().await;
        let Some(newest) = negotiations.get_mut(&trip_id).and_then(|log| log.last_mut()) else {
            return Ok(false);
        };
        if newest.id != record_id || !newest.is_pending() {
            return Ok(false);
        }
        newest.outcome = outcome;
        Ok(true)
    }
}

#[derive(Default)]
struct MoneyState {
    movements: HashMap<MovementId, MoneyMovement>,
    by_ref: HashMap<String, MovementId>,
    balances: HashMap<UserId, Money>,
}

impl MoneyState {
    fn apply(&mut self, delta: &BalanceDelta) -> Result<Money> {
        let balance = self.balances.entry(delta.account.clone()).or_default();
        *balance = balance.checked_add(delta.delta)?;
        Ok(*balance)
    }

    fn slot_holder(&self, movement: &MoneyMovement) -> Option<&MoneyMovement> {
        let trip_id = movement.trip_id?;
        self.movements.values().find(|m| {
            m.trip_id == Some(trip_id)
                && m.direction == movement.direction
                && m.direction.holds_trip_slot(m.state)
        })
    }
}

/// A thread-safe in-memory store for money movements and balances.
///
/// Movements and balances share one lock so a settlement and its balance
/// adjustment are applied together.
#[derive(Default, Clone)]
pub struct InMemoryMoneyStore {
    state: Arc<RwLock<MoneyState>>,
}

impl InMemoryMoneyStore {
    /// Creates a new, empty in-memory money store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MoneyStore for InMemoryMoneyStore {
    async fn open_movement_unique(
        &self,
        movement: MoneyMovement,
        delta: Option<BalanceDelta>,
    ) -> Result<MovementSlot> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.slot_holder(&movement) {
            return Ok(MovementSlot::from_existing(existing.clone()));
        }
        if let Some(delta) = &delta {
            state.apply(delta)?;
        }
        state.movements.insert(movement.id, movement.clone());
        Ok(MovementSlot::Opened(movement))
    }

    async fn insert_movement(
        &self,
        movement: MoneyMovement,
        delta: Option<BalanceDelta>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if state.movements.contains_key(&movement.id) {
            return Err(TripError::Conflict(format!(
                "movement {} already exists",
                movement.id
            )));
        }
        if let Some(delta) = &delta {
            let balance = state.balances.get(&delta.account).copied().unwrap_or_default();
            let after = balance.checked_add(delta.delta)?;
            if delta.delta < Money::ZERO && after < Money::ZERO {
                return Err(TripError::InsufficientFunds {
                    balance: balance.minor_units(),
                    requested: delta.delta.negate().minor_units(),
                });
            }
            state.apply(delta)?;
        }
        state.movements.insert(movement.id, movement);
        Ok(())
    }

    async fn load_movement(&self, id: MovementId) -> Result<Option<MoneyMovement>> {
        let state = self.state.read().await;
        Ok(state.movements.get(&id).cloned())
    }

    async fn load_movement_by_ref(&self, reference: &str) -> Result<Option<MoneyMovement>> {
        let state = self.state.read().await;
        Ok(state
            .by_ref
            .get(reference)
            .and_then(|id| state.movements.get(id))
            .cloned())
    }

    async fn movements_for_trip(&self, trip_id: TripId) -> Result<Vec<MoneyMovement>> {
        let state = self.state.read().await;
        let mut movements: Vec<MoneyMovement> = state
            .movements
            .values()
            .filter(|m| m.trip_id == Some(trip_id))
            .cloned()
            .collect();
        movements.sort_by_key(|m| m.id);
        Ok(movements)
    }

    async fn attach_reference(&self, id: MovementId, reference: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        if let Some(owner) = state.by_ref.get(reference) {
            if *owner == id {
                return Ok(true);
            }
            return Err(TripError::Conflict(format!(
                "reference {reference} already belongs to movement {owner}"
            )));
        }
        let Some(movement) = state.movements.get_mut(&id) else {
            return Err(TripError::not_found("movement", id));
        };
        if movement.external_reference.is_some() {
            return Ok(false);
        }
        movement.external_reference = Some(reference.to_string());
        state.by_ref.insert(reference.to_string(), id);
        Ok(true)
    }

    async fn settle_movement_if(
        &self,
        id: MovementId,
        expected: MovementState,
        next: MovementState,
        delta: Option<BalanceDelta>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.movements.get(&id) {
            None => return Err(TripError::not_found("movement", id)),
            Some(movement) if movement.state != expected => return Ok(false),
            Some(_) => {}
        }
        if let Some(delta) = &delta {
            state.apply(delta)?;
        }
        if let Some(movement) = state.movements.get_mut(&id) {
            movement.state = next;
            movement.settled_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn balance(&self, account: &UserId) -> Result<Money> {
        let state = self.state.read().await;
        Ok(state.balances.get(account).copied().unwrap_or_default())
    }

    async fn adjust_balance(&self, account: &UserId, delta: Money) -> Result<Money> {
        let mut state = self.state.write().await;
        state.apply(&BalanceDelta {
            account: account.clone(),
            delta,
        })
    }

    async fn balances(&self) -> Result<Vec<(UserId, Money)>> {
        let state = self.state.read().await;
        let mut all: Vec<(UserId, Money)> = state
            .balances
            .iter()
            .map(|(account, balance)| (account.clone(), *balance))
            .collect();
        all.sort();
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::movement::Direction;
    use crate::domain::trip::{NewTrip, TripKind};

    fn ride() -> Trip {
        Trip::new(NewTrip {
            kind: TripKind::SharedRide,
            requester_id: UserId::from("rider"),
            provider_id: Some(UserId::from("driver")),
            initial_price: Money(1000),
            total_passengers: Some(2),
            message: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_trip_if_is_conditional() {
        let store = InMemoryTripStore::new();
        let trip = ride();
        store.insert_trip(trip.clone()).await.unwrap();

        let mut next = trip.clone();
        next.status = TripStatus::Approved;
        let saved = store
            .save_trip_if(&next, TripStatus::Requested)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.version, 1);

        // Same version again loses: the row has moved on.
        assert!(
            store
                .save_trip_if(&next, TripStatus::Requested)
                .await
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            store.insert_trip(trip).await,
            Err(TripError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_increment_boarded_respects_ceiling() {
        let store = InMemoryTripStore::new();
        let mut trip = ride();
        trip.status = TripStatus::Arrived;
        store.insert_trip(trip.clone()).await.unwrap();

        let after = store.increment_boarded_if(trip.id, 1).await.unwrap().unwrap();
        assert_eq!(after.boarded_count, 1);
        assert!(store.increment_boarded_if(trip.id, 2).await.unwrap().is_none());
        let after = store.increment_boarded_if(trip.id, 1).await.unwrap().unwrap();
        assert_eq!(after.boarded_count, 2);
    }

    #[tokio::test]
    async fn test_append_negotiation_supersedes_pending() {
        let store = InMemoryTripStore::new();
        let trip = ride();
        let first = NegotiationRecord::pending(trip.id, UserId::from("rider"), Money(1000), None);
        let first = store.append_negotiation(first, None).await.unwrap().unwrap();
        assert_eq!(first.seq, 0);

        let second = NegotiationRecord::pending(trip.id, UserId::from("driver"), Money(1200), None);
        // Wrong expectation is rejected.
        assert!(
            store
                .append_negotiation(second.clone(), None)
                .await
                .unwrap()
                .is_none()
        );
        let second = store
            .append_negotiation(second, Some(first.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.seq, 1);

        let log = store.negotiations(trip.id).await.unwrap();
        assert_eq!(log[0].outcome, OfferOutcome::Superseded);
        assert_eq!(log[1].outcome, OfferOutcome::Pending);

        // Only the newest pending record may be resolved.
        assert!(
            !store
                .resolve_negotiation_if(trip.id, first.id, OfferOutcome::Accepted)
                .await
                .unwrap()
        );
        assert!(
            store
                .resolve_negotiation_if(trip.id, second.id, OfferOutcome::Accepted)
                .await
                .unwrap()
        );
        assert!(
            !store
                .resolve_negotiation_if(trip.id, second.id, OfferOutcome::Rejected)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_collection_slot_is_unique() {
        let store = InMemoryMoneyStore::new();
        let trip_id = TripId::new();
        let driver = UserId::from("driver");
        let first = MoneyMovement::pending(Some(trip_id), driver.clone(), Direction::Collect, Money(500));
        let second = MoneyMovement::pending(Some(trip_id), driver, Direction::Collect, Money(500));

        let opened = store.open_movement_unique(first.clone(), None).await.unwrap();
        assert!(matches!(opened, MovementSlot::Opened(_)));
        let again = store.open_movement_unique(second.clone(), None).await.unwrap();
        assert_eq!(again, MovementSlot::Pending(first.clone()));

        // A failed collection frees the slot.
        store
            .settle_movement_if(first.id, MovementState::Pending, MovementState::Failed, None)
            .await
            .unwrap();
        let reopened = store.open_movement_unique(second, None).await.unwrap();
        assert!(matches!(reopened, MovementSlot::Opened(_)));
    }

    #[tokio::test]
    async fn test_settle_applies_delta_once() {
        let store = InMemoryMoneyStore::new();
        let driver = UserId::from("driver");
        let movement = MoneyMovement::pending(None, driver.clone(), Direction::Collect, Money(700));
        store.insert_movement(movement.clone(), None).await.unwrap();

        let credit = Some(BalanceDelta::credit(driver.clone(), Money(700)));
        assert!(
            store
                .settle_movement_if(movement.id, MovementState::Pending, MovementState::Completed, credit.clone())
                .await
                .unwrap()
        );
        assert!(
            !store
                .settle_movement_if(movement.id, MovementState::Pending, MovementState::Completed, credit)
                .await
                .unwrap()
        );
        assert_eq!(store.balance(&driver).await.unwrap(), Money(700));
    }

    #[tokio::test]
    async fn test_insert_movement_checks_funds() {
        let store = InMemoryMoneyStore::new();
        let driver = UserId::from("driver");
        store.adjust_balance(&driver, Money(100)).await.unwrap();

        let payout = MoneyMovement::pending(None, driver.clone(), Direction::Payout, Money(150));
        let result = store
            .insert_movement(payout.clone(), Some(BalanceDelta::debit(driver.clone(), Money(150))))
            .await;
        assert!(matches!(result, Err(TripError::InsufficientFunds { balance: 100, requested: 150 })));
        assert!(store.load_movement(payout.id).await.unwrap().is_none());
        assert_eq!(store.balance(&driver).await.unwrap(), Money(100));
    }

    #[tokio::test]
    async fn test_references_are_unique() {
        let store = InMemoryMoneyStore::new();
        let driver = UserId::from("driver");
        let a = MoneyMovement::pending(None, driver.clone(), Direction::Payout, Money(1));
        let b = MoneyMovement::pending(None, driver, Direction::Payout, Money(1));
        store.insert_movement(a.clone(), None).await.unwrap();
        store.insert_movement(b.clone(), None).await.unwrap();

        assert!(store.attach_reference(a.id, "SBX-1").await.unwrap());
        assert!(store.attach_reference(a.id, "SBX-1").await.unwrap());
        assert!(!store.attach_reference(a.id, "SBX-2").await.unwrap());
        assert!(matches!(
            store.attach_reference(b.id, "SBX-1").await,
            Err(TripError::Conflict(_))
        ));
        let found = store.load_movement_by_ref("SBX-1").await.unwrap().unwrap();
        assert_eq!(found.id, a.id);
    }
}
