#![allow(dead_code)]

use std::sync::Arc;
use tripflow::application::engine::TripEngine;
use tripflow::config::EngineConfig;
use tripflow::domain::ids::{TripId, UserId};
use tripflow::domain::money::Money;
use tripflow::domain::ports::GatewayStatus;
use tripflow::domain::trip::{NewTrip, PaymentTiming, TripKind, TripStatus};
use tripflow::infrastructure::in_memory::{InMemoryMoneyStore, InMemoryTripStore};
use tripflow::infrastructure::notifier::BroadcastNotifier;
use tripflow::infrastructure::sandbox_gateway::SandboxGateway;

pub const RIDER: &str = "alice";
pub const DRIVER: &str = "bob";
pub const HIRER: &str = "carol";
pub const OWNER: &str = "dana";
pub const PHONE: &str = "+255700000001";

/// An engine over in-memory stores, keeping handles to every adapter so
/// tests can inspect what the engine wrote.
pub struct Harness {
    pub engine: Arc<TripEngine>,
    pub trips: Arc<InMemoryTripStore>,
    pub money: Arc<InMemoryMoneyStore>,
    pub gateway: SandboxGateway,
    pub notifier: BroadcastNotifier,
}

pub fn harness() -> Harness {
    harness_with(SandboxGateway::new(), EngineConfig::default())
}

pub fn harness_with(gateway: SandboxGateway, config: EngineConfig) -> Harness {
    let trips = Arc::new(InMemoryTripStore::new());
    let money = Arc::new(InMemoryMoneyStore::new());
    let notifier = BroadcastNotifier::new(1024);
    let engine = TripEngine::new(
        trips.clone(),
        money.clone(),
        Arc::new(gateway.clone()),
        Arc::new(notifier.clone()),
        &config,
    );
    Harness {
        engine: Arc::new(engine),
        trips,
        money,
        gateway,
        notifier,
    }
}

pub fn user(id: &str) -> UserId {
    UserId::from(id)
}

impl Harness {
    /// A shared ride from alice, taken up by bob, approved at `price`.
    pub async fn approved_ride(&self, price: i64, passengers: u32) -> TripId {
        let negotiation = self.engine.negotiation();
        let trip = negotiation
            .create_trip(NewTrip {
                kind: TripKind::SharedRide,
                requester_id: user(RIDER),
                provider_id: None,
                initial_price: Money(price),
                total_passengers: Some(passengers),
                message: None,
            })
            .await
            .unwrap();
        negotiation.assign_provider(trip.id, &user(DRIVER)).await.unwrap();
        negotiation
            .approve(trip.id, &user(DRIVER), Money(price))
            .await
            .unwrap();
        trip.id
    }

    /// An approved ride driven to `Arrived`.
    pub async fn arrived_ride(&self, price: i64, passengers: u32) -> TripId {
        let id = self.approved_ride(price, passengers).await;
        let execution = self.engine.execution();
        execution.start_inbound(id, &user(DRIVER)).await.unwrap();
        execution.mark_arrived(id, &user(DRIVER)).await.unwrap();
        id
    }

    /// A single-passenger ride driven to `PaymentDue`, collection open.
    pub async fn ride_in_payment_due(&self, price: i64) -> TripId {
        let id = self.arrived_ride(price, 1).await;
        let execution = self.engine.execution();
        execution.confirm_boarding(id, &user(RIDER)).await.unwrap();
        execution.start_trip(id, &user(DRIVER)).await.unwrap();
        let trip = execution.request_payment(id, &user(DRIVER)).await.unwrap();
        assert_eq!(trip.status, TripStatus::PaymentDue);
        id
    }

    /// An exclusive hire from carol to dana, approved and scheduled.
    pub async fn scheduled_hire(&self, price: i64, timing: PaymentTiming) -> TripId {
        let negotiation = self.engine.negotiation();
        let trip = negotiation
            .create_trip(NewTrip {
                kind: TripKind::ExclusiveHire,
                requester_id: user(HIRER),
                provider_id: Some(user(OWNER)),
                initial_price: Money(price),
                total_passengers: None,
                message: None,
            })
            .await
            .unwrap();
        negotiation
            .approve(trip.id, &user(OWNER), Money(price))
            .await
            .unwrap();
        self.engine
            .execution()
            .choose_payment_timing(trip.id, &user(HIRER), timing)
            .await
            .unwrap();
        trip.id
    }

    /// Starts a charge for the trip and returns its gateway reference.
    pub async fn start_charge(&self, trip_id: TripId) -> String {
        self.engine
            .reconciler()
            .start_collection(trip_id, PHONE)
            .await
            .unwrap()
            .external_reference
            .unwrap()
    }

    /// Charges the trip and has the gateway report success by polling.
    pub async fn pay(&self, trip_id: TripId) -> String {
        let reference = self.start_charge(trip_id).await;
        self.gateway
            .set_outcome(&reference, GatewayStatus::Success)
            .await
            .unwrap();
        self.engine
            .reconciler()
            .poll_outcome(&reference)
            .await
            .unwrap();
        reference
    }
}
