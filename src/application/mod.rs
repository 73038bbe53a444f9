//! Application layer containing the trip lifecycle orchestration.
//!
//! The engines hold no per-trip state in memory. Every step reloads the trip
//! from the store and writes it back with a conditional update, so any
//! number of workers, in any number of processes, may serve the same trip.

pub mod engine;
pub mod execution;
pub mod negotiation;
pub mod reconciler;

use crate::domain::events::TripEvent;
use crate::domain::ids::TripId;
use crate::domain::ports::{Notifier, TripStore};
use crate::domain::trip::{Trip, TripStatus};
use crate::error::{Result, TripError};
use tracing::info;

/// Upper bound on reload-and-retry loops for idempotent internal updates.
pub(crate) const MAX_CAS_ATTEMPTS: usize = 8;

pub(crate) async fn load_trip(store: &dyn TripStore, id: TripId) -> Result<Trip> {
    store
        .load_trip(id)
        .await?
        .ok_or_else(|| TripError::not_found("trip", id))
}

pub(crate) fn expect_status(trip: &Trip, expected: TripStatus) -> Result<()> {
    if trip.status == expected {
        Ok(())
    } else {
        Err(TripError::StaleState {
            expected,
            actual: trip.status,
        })
    }
}

/// Moves `trip` from its current status to `next` with one conditional
/// update. `edit` may change other fields in the same write.
///
/// Fails with `StaleState` if the stored trip changed since it was loaded.
pub(crate) async fn transition(
    store: &dyn TripStore,
    notifier: &dyn Notifier,
    trip: &Trip,
    next: TripStatus,
    edit: impl FnOnce(&mut Trip),
) -> Result<Trip> {
    let from = trip.status;
    if !trip.kind.permits(from, next) {
        return Err(TripError::Validation(format!(
            "{} trips cannot move from {from} to {next}",
            trip.kind.as_str()
        )));
    }

    let mut updated = trip.clone();
    updated.status = next;
    edit(&mut updated);

    let Some(saved) = store.save_trip_if(&updated, from).await? else {
        let actual = load_trip(store, trip.id).await?.status;
        return Err(TripError::StaleState {
            expected: from,
            actual,
        });
    };

    info!(trip_id = %saved.id, %from, to = %next, "trip transitioned");
    notify_parties(
        notifier,
        &saved,
        TripEvent::StatusChanged {
            trip_id: saved.id,
            from,
            to: next,
        },
    );
    Ok(saved)
}

pub(crate) fn notify_parties(notifier: &dyn Notifier, trip: &Trip, event: TripEvent) {
    notifier.publish(&trip.requester_id, event.clone());
    if let Some(provider) = &trip.provider_id {
        notifier.publish(provider, event);
    }
}
