mod common;

use common::{DRIVER, PHONE, RIDER, harness, user};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tripflow::application::engine::TripEngine;
use tripflow::domain::events::TripEvent;
use tripflow::domain::ids::TripId;
use tripflow::domain::money::Money;
use tripflow::domain::movement::{MovementState, Outcome};
use tripflow::domain::negotiation::OfferOutcome;
use tripflow::domain::ports::{GatewayStatus, MoneyStore};
use tripflow::domain::trip::{NewTrip, PaymentState, Trip, TripKind, TripStatus};
use tripflow::error::{Result, TripError};

type Step = fn(Arc<TripEngine>, TripId) -> tokio::task::JoinHandle<Result<Trip>>;

fn inbound(engine: Arc<TripEngine>, id: TripId) -> tokio::task::JoinHandle<Result<Trip>> {
    tokio::spawn(async move { engine.execution().start_inbound(id, &user(DRIVER)).await })
}

fn arrived(engine: Arc<TripEngine>, id: TripId) -> tokio::task::JoinHandle<Result<Trip>> {
    tokio::spawn(async move { engine.execution().mark_arrived(id, &user(DRIVER)).await })
}

fn boarded(engine: Arc<TripEngine>, id: TripId) -> tokio::task::JoinHandle<Result<Trip>> {
    tokio::spawn(async move { engine.execution().confirm_boarding(id, &user(RIDER)).await })
}

fn started(engine: Arc<TripEngine>, id: TripId) -> tokio::task::JoinHandle<Result<Trip>> {
    tokio::spawn(async move { engine.execution().start_trip(id, &user(DRIVER)).await })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_transition_has_exactly_one_winner() {
    let mut rng = StdRng::seed_from_u64(0x7121_f10f);
    let h = harness();
    let mut events = h.notifier.subscribe();

    for _ in 0..20 {
        let id = h.approved_ride(1000, 1).await;
        let steps: [(Step, TripStatus); 3] = [
            (inbound, TripStatus::Approved),
            (arrived, TripStatus::Inbound),
            (started, TripStatus::Boarded),
        ];
        for (i, (step, expected)) in steps.into_iter().enumerate() {
            if i == 2 {
                boarded(h.engine.clone(), id).await.unwrap().unwrap();
            }
            let contenders = rng.gen_range(2..8);
            let handles: Vec<_> = (0..contenders)
                .map(|_| step(h.engine.clone(), id))
                .collect();

            let mut winners = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(_) => winners += 1,
                    Err(TripError::StaleState { expected: e, .. }) => assert_eq!(e, expected),
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
            assert_eq!(winners, 1, "exactly one caller may move the trip out of {expected}");
        }
    }

    // Approval is announced separately, so status changes start at Inbound
    // and must follow the shared-ride path from there without gaps.
    let path = TripKind::SharedRide.path();
    let mut observed: std::collections::HashMap<TripId, Vec<TripStatus>> = Default::default();
    while let Ok(n) = events.try_recv() {
        if n.topic != user(RIDER) {
            continue;
        }
        if let TripEvent::StatusChanged { trip_id, to, .. } = n.event {
            observed.entry(trip_id).or_default().push(to);
        }
    }
    assert_eq!(observed.len(), 20);
    for statuses in observed.values() {
        assert_eq!(statuses.as_slice(), &path[2..2 + statuses.len()]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_boarding_never_exceeds_seats() {
    let h = harness();
    let id = h.arrived_ride(3000, 5).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .execution()
                    .board_passengers(id, &user(DRIVER), 1)
                    .await
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(TripError::Conflict(_)) | Err(TripError::StaleState { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let trip = h.engine.trip(id).await.unwrap();
    assert_eq!(accepted, 5);
    assert_eq!(trip.boarded_count, 5);
    assert_eq!(trip.status, TripStatus::Boarded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_reports_credit_once() {
    let mut rng = StdRng::seed_from_u64(42);
    let h = harness();

    for _ in 0..10 {
        let id = h.ride_in_payment_due(1200).await;
        let reference = h.start_charge(id).await;
        h.gateway
            .set_outcome(&reference, GatewayStatus::Success)
            .await
            .unwrap();
        let before = h.engine.balance(&user(DRIVER)).await.unwrap();

        let deliveries = rng.gen_range(2..10);
        let handles: Vec<_> = (0..deliveries)
            .map(|i| {
                let engine = h.engine.clone();
                let reference = reference.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        engine.reconciler().poll_outcome(&reference).await
                    } else {
                        engine
                            .reconciler()
                            .report_outcome(&reference, Outcome::Success, Money(1200))
                            .await
                    }
                })
            })
            .collect();
        for handle in handles {
            let movement = handle.await.unwrap().unwrap();
            assert_eq!(movement.state, MovementState::Completed);
        }

        let after = h.engine.balance(&user(DRIVER)).await.unwrap();
        assert_eq!(after.checked_sub(before).unwrap(), Money(1200));
        let trip = h.engine.trip(id).await.unwrap();
        assert_eq!(trip.payment_state, PaymentState::Paid);
        assert_eq!(trip.status, TripStatus::Completed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_approve_retries() {
    let h = harness();
    let negotiation = h.engine.negotiation();
    let trip = negotiation
        .create_trip(NewTrip {
            kind: TripKind::SharedRide,
            requester_id: user(RIDER),
            provider_id: Some(user(DRIVER)),
            initial_price: Money(1000),
            total_passengers: None,
            message: None,
        })
        .await
        .unwrap();
    let trip_id = trip.id;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .negotiation()
                    .approve(trip_id, &user(DRIVER), Money(1000))
                    .await
            })
        })
        .collect();
    for handle in handles {
        let approved = handle.await.unwrap().unwrap();
        assert_eq!(approved.status, TripStatus::Approved);
        assert_eq!(approved.agreed_price, Some(Money(1000)));
    }

    let log = h.engine.negotiation().history(trip_id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].outcome, OfferOutcome::Accepted);
}

#[tokio::test]
async fn test_closed_negotiation_is_never_mutated() {
    let h = harness();
    let id = h.approved_ride(1000, 1).await;
    let closed = h.engine.negotiation().history(id).await.unwrap();

    for (by, price) in [(RIDER, 900), (DRIVER, 1100)] {
        let result = h
            .engine
            .negotiation()
            .propose(id, &user(by), Money(price), None)
            .await;
        assert!(matches!(result, Err(TripError::Conflict(_))));
    }
    assert_eq!(h.engine.negotiation().history(id).await.unwrap(), closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_collection_charges_once() {
    let h = harness();
    let id = h.ride_in_payment_due(700).await;

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.reconciler().start_collection(id, PHONE).await })
        })
        .collect();
    let mut movement_ids = Vec::new();
    for handle in handles {
        movement_ids.push(handle.await.unwrap().unwrap().id);
    }
    movement_ids.dedup();
    assert_eq!(movement_ids.len(), 1);

    let movements = h.money.movements_for_trip(id).await.unwrap();
    assert_eq!(movements.len(), 1);
    assert!(movements[0].external_reference.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_offers_leave_one_pending() {
    let h = harness();
    let trip = h
        .engine
        .negotiation()
        .create_trip(NewTrip {
            kind: TripKind::SharedRide,
            requester_id: user(RIDER),
            provider_id: Some(user(DRIVER)),
            initial_price: Money(1000),
            total_passengers: None,
            message: None,
        })
        .await
        .unwrap();
    let trip_id = trip.id;

    let handles: Vec<_> = (0..6i64)
        .map(|i| {
            let engine = h.engine.clone();
            let by = if i % 2 == 0 { RIDER } else { DRIVER };
            tokio::spawn(async move {
                engine
                    .negotiation()
                    .propose(trip_id, &user(by), Money(1100 + i * 10), None)
                    .await
            })
        })
        .collect();
    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(TripError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(accepted >= 1);

    let log = h.engine.negotiation().history(trip_id).await.unwrap();
    let pending: Vec<_> = log.iter().filter(|r| r.is_pending()).collect();
    assert_eq!(pending.len(), 1);
    let newest = log.last().unwrap();
    assert_eq!(pending[0].id, newest.id);
    assert!(
        log[..log.len() - 1]
            .iter()
            .all(|r| r.outcome == OfferOutcome::Superseded)
    );

    let trip = h.engine.trip(trip_id).await.unwrap();
    assert_eq!(trip.offered_price, Some(newest.price));
    assert_eq!(trip.status, TripStatus::Requested);
}
