use super::execution::ExecutionEngine;
use super::negotiation::NegotiationEngine;
use super::reconciler::PaymentReconciler;
use crate::config::EngineConfig;
use crate::domain::ids::{TripId, UserId};
use crate::domain::money::Money;
use crate::domain::ports::{GatewayHandle, MoneyStoreHandle, NotifierHandle, TripStoreHandle};
use crate::domain::trip::Trip;
use crate::error::{Result, TripError};
use crate::infrastructure::in_memory::{InMemoryMoneyStore, InMemoryTripStore};
use crate::infrastructure::timeout::TimeoutStore;
use std::sync::Arc;

/// Wires the three engines to one set of store, gateway and notifier
/// handles.
///
/// `TripEngine` is cheap to share behind an `Arc`; it holds no trip state
/// of its own, so several instances over the same stores behave like one.
pub struct TripEngine {
    trips: TripStoreHandle,
    money: MoneyStoreHandle,
    negotiation: NegotiationEngine,
    execution: ExecutionEngine,
    reconciler: Arc<PaymentReconciler>,
}

/// Final state of a replay: balances per provider and every trip.
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub balances: Vec<(UserId, Money)>,
    pub trips: Vec<Trip>,
}

impl TripEngine {
    pub fn new(
        trips: TripStoreHandle,
        money: MoneyStoreHandle,
        gateway: GatewayHandle,
        notifier: NotifierHandle,
        config: &EngineConfig,
    ) -> Self {
        let reconciler = Arc::new(PaymentReconciler::new(
            trips.clone(),
            money.clone(),
            gateway,
            notifier.clone(),
            config.fee_policy,
            config.gateway_timeout,
        ));
        Self {
            negotiation: NegotiationEngine::new(trips.clone(), notifier.clone()),
            execution: ExecutionEngine::new(trips.clone(), notifier, reconciler.clone()),
            reconciler,
            trips,
            money,
        }
    }

    /// An engine over fresh in-memory stores, each call bounded by the
    /// configured store timeout.
    pub fn in_memory(gateway: GatewayHandle, notifier: NotifierHandle, config: &EngineConfig) -> Self {
        let trips = Arc::new(TimeoutStore::new(
            InMemoryTripStore::new(),
            config.store_timeout,
        ));
        let money = Arc::new(TimeoutStore::new(
            InMemoryMoneyStore::new(),
            config.store_timeout,
        ));
        Self::new(trips, money, gateway, notifier, config)
    }

    pub fn negotiation(&self) -> &NegotiationEngine {
        &self.negotiation
    }

    pub fn execution(&self) -> &ExecutionEngine {
        &self.execution
    }

    pub fn reconciler(&self) -> &Arc<PaymentReconciler> {
        &self.reconciler
    }

    pub async fn trip(&self, id: TripId) -> Result<Trip> {
        self.trips
            .load_trip(id)
            .await?
            .ok_or_else(|| TripError::not_found("trip", id))
    }

    pub async fn balance(&self, account: &UserId) -> Result<Money> {
        self.money.balance(account).await
    }

    pub async fn report(&self) -> Result<EngineReport> {
        Ok(EngineReport {
            balances: self.money.balances().await?,
            trips: self.trips.all_trips().await?,
        })
    }
}
