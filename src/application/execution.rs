use super::reconciler::{CollectionVoid, PaymentReconciler};
use super::{MAX_CAS_ATTEMPTS, expect_status, load_trip, notify_parties, transition};
use crate::domain::events::TripEvent;
use crate::domain::ids::{TripId, UserId};
use crate::domain::negotiation::OfferOutcome;
use crate::domain::ports::{NotifierHandle, TripStoreHandle};
use crate::domain::trip::{
    NegotiationStatus, PaymentState, PaymentTiming, Trip, TripKind, TripStatus,
};
use crate::error::{Result, TripError};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

/// Drives approved trips through their kind's execution path.
///
/// Every operation is a single conditional step: if the trip moved since it
/// was loaded the caller gets `StaleState` and may reload and retry.
pub struct ExecutionEngine {
    trips: TripStoreHandle,
    notifier: NotifierHandle,
    reconciler: Arc<PaymentReconciler>,
}

impl ExecutionEngine {
    pub fn new(
        trips: TripStoreHandle,
        notifier: NotifierHandle,
        reconciler: Arc<PaymentReconciler>,
    ) -> Self {
        Self {
            trips,
            notifier,
            reconciler,
        }
    }

    async fn provider_step(
        &self,
        trip_id: TripId,
        provider: &UserId,
        kind: TripKind,
        action: &'static str,
        from: TripStatus,
        to: TripStatus,
    ) -> Result<Trip> {
        let trip = load_trip(self.trips.as_ref(), trip_id).await?;
        trip.require_kind(kind, action)?;
        trip.require_provider(provider, action)?;
        expect_status(&trip, from)?;
        self.advance(&trip, to).await
    }

    async fn advance(&self, trip: &Trip, to: TripStatus) -> Result<Trip> {
        transition(self.trips.as_ref(), self.notifier.as_ref(), trip, to, |t| {
            if to == TripStatus::Completed {
                t.completed_at = Some(Utc::now());
            }
        })
        .await
    }

    pub async fn start_inbound(&self, trip_id: TripId, provider: &UserId) -> Result<Trip> {
        self.provider_step(
            trip_id,
            provider,
            TripKind::SharedRide,
            "head to pickup",
            TripStatus::Approved,
            TripStatus::Inbound,
        )
        .await
    }

    pub async fn mark_arrived(&self, trip_id: TripId, provider: &UserId) -> Result<Trip> {
        self.provider_step(
            trip_id,
            provider,
            TripKind::SharedRide,
            "mark arrival",
            TripStatus::Inbound,
            TripStatus::Arrived,
        )
        .await
    }

    /// Provider confirms `count` passengers on board.
    pub async fn board_passengers(
        &self,
        trip_id: TripId,
        provider: &UserId,
        count: u32,
    ) -> Result<Trip> {
        let trip = load_trip(self.trips.as_ref(), trip_id).await?;
        trip.require_kind(TripKind::SharedRide, "board passengers")?;
        trip.require_provider(provider, "board passengers")?;
        self.board(trip, count).await
    }

    /// A passenger confirms they are on board.
    pub async fn confirm_boarding(&self, trip_id: TripId, requester: &UserId) -> Result<Trip> {
        let trip = load_trip(self.trips.as_ref(), trip_id).await?;
        trip.require_kind(TripKind::SharedRide, "confirm boarding")?;
        trip.require_requester(requester, "confirm boarding")?;
        self.board(trip, 1).await
    }

    async fn board(&self, trip: Trip, count: u32) -> Result<Trip> {
        if count == 0 {
            return Err(TripError::Validation(
                "boarding count must be at least one".to_string(),
            ));
        }
        expect_status(&trip, TripStatus::Arrived)?;

        let Some(boarded) = self.trips.increment_boarded_if(trip.id, count).await? else {
            let current = load_trip(self.trips.as_ref(), trip.id).await?;
            expect_status(&current, TripStatus::Arrived)?;
            return Err(TripError::Conflict(format!(
                "boarding {count} exceeds the {} seats left",
                current.total_passengers.saturating_sub(current.boarded_count)
            )));
        };

        info!(trip_id = %boarded.id, boarded = boarded.boarded_count, total = boarded.total_passengers, "passengers boarded");
        notify_parties(
            self.notifier.as_ref(),
            &boarded,
            TripEvent::PassengersBoarded {
                trip_id: boarded.id,
                boarded: boarded.boarded_count,
                total: boarded.total_passengers,
            },
        );

        if boarded.boarded_count < boarded.total_passengers {
            return Ok(boarded);
        }
        match self.advance(&boarded, TripStatus::Boarded).await {
            Ok(trip) => Ok(trip),
            // Whoever boarded the last passenger concurrently advanced it.
            Err(TripError::StaleState { .. }) => load_trip(self.trips.as_ref(), boarded.id).await,
            Err(e) => Err(e),
        }
    }

    pub async fn start_trip(&self, trip_id: TripId, provider: &UserId) -> Result<Trip> {
        self.provider_step(
            trip_id,
            provider,
            TripKind::SharedRide,
            "start the ride",
            TripStatus::Boarded,
            TripStatus::InProgress,
        )
        .await
    }

    /// Ends the ride and opens the collection for the agreed price.
    pub async fn request_payment(&self, trip_id: TripId, provider: &UserId) -> Result<Trip> {
        let trip = self
            .provider_step(
                trip_id,
                provider,
                TripKind::SharedRide,
                "request payment",
                TripStatus::InProgress,
                TripStatus::PaymentDue,
            )
            .await?;
        self.reconciler
            .open_collection(trip_id, trip.billable_amount()?)
            .await?;
        load_trip(self.trips.as_ref(), trip_id).await
    }

    /// The hirer picks when to pay. Paying now opens the collection at once.
    pub async fn choose_payment_timing(
        &self,
        trip_id: TripId,
        requester: &UserId,
        timing: PaymentTiming,
    ) -> Result<Trip> {
        let trip = load_trip(self.trips.as_ref(), trip_id).await?;
        trip.require_kind(TripKind::ExclusiveHire, "choose payment timing")?;
        trip.require_requester(requester, "choose payment timing")?;
        expect_status(&trip, TripStatus::AwaitingPaymentChoice)?;

        let scheduled = transition(
            self.trips.as_ref(),
            self.notifier.as_ref(),
            &trip,
            TripStatus::Scheduled,
            |t| t.payment_timing = Some(timing),
        )
        .await?;
        if timing == PaymentTiming::Now {
            self.reconciler
                .open_collection(trip_id, scheduled.billable_amount()?)
                .await?;
            return load_trip(self.trips.as_ref(), trip_id).await;
        }
        Ok(scheduled)
    }

    /// The owner hands the vehicle over. A paid hire goes straight to
    /// `Active`; otherwise it waits in `HandoverPending` for the payment.
    pub async fn confirm_handover(&self, trip_id: TripId, provider: &UserId) -> Result<Trip> {
        let trip = load_trip(self.trips.as_ref(), trip_id).await?;
        trip.require_kind(TripKind::ExclusiveHire, "confirm handover")?;
        trip.require_provider(provider, "confirm handover")?;
        expect_status(&trip, TripStatus::Scheduled)?;

        if trip.payment_state == PaymentState::Paid {
            return self.advance(&trip, TripStatus::Active).await;
        }
        let pending = self.advance(&trip, TripStatus::HandoverPending).await?;
        self.reconciler
            .open_collection(trip_id, pending.billable_amount()?)
            .await?;
        load_trip(self.trips.as_ref(), trip_id).await
    }

    pub async fn request_return(&self, trip_id: TripId, requester: &UserId) -> Result<Trip> {
        let trip = load_trip(self.trips.as_ref(), trip_id).await?;
        trip.require_kind(TripKind::ExclusiveHire, "return the vehicle")?;
        trip.require_requester(requester, "return the vehicle")?;
        expect_status(&trip, TripStatus::Active)?;
        self.advance(&trip, TripStatus::ReturnPending).await
    }

    pub async fn confirm_return_received(
        &self,
        trip_id: TripId,
        provider: &UserId,
    ) -> Result<Trip> {
        self.provider_step(
            trip_id,
            provider,
            TripKind::ExclusiveHire,
            "confirm the return",
            TripStatus::ReturnPending,
            TripStatus::Completed,
        )
        .await
    }

    /// Cancels the trip on behalf of either party.
    ///
    /// A pending collection is failed first. If the trip turns out to be
    /// paid, the payment is refunded. Calling again on a cancelled trip
    /// re-drives an unfinished refund.
    pub async fn cancel(&self, trip_id: TripId, by: &UserId) -> Result<Trip> {
        let trip = load_trip(self.trips.as_ref(), trip_id).await?;
        if trip.party_of(by).is_none() {
            return Err(TripError::forbidden(by, "cancel this trip"));
        }
        if trip.status == TripStatus::Cancelled {
            if trip.payment_state == PaymentState::Refunded {
                self.reconciler.ensure_refund(&trip).await?;
            }
            return Ok(trip);
        }
        if !trip.status.is_cancellable() {
            return Err(TripError::Conflict(format!(
                "trip {trip_id} cannot be cancelled while {}",
                trip.status
            )));
        }

        if trip.status == TripStatus::Requested {
            self.close_open_offer(&trip).await?;
        }
        let void = self.reconciler.void_pending_collection(&trip).await?;
        // Voiding may have changed the trip; cancel what is stored now.
        let trip = load_trip(self.trips.as_ref(), trip_id).await?;
        if !trip.status.is_cancellable() {
            return Err(TripError::Conflict(format!(
                "trip {trip_id} cannot be cancelled while {}",
                trip.status
            )));
        }

        let refund = trip.payment_state == PaymentState::Paid || void == CollectionVoid::AlreadyPaid;
        let cancelled = transition(
            self.trips.as_ref(),
            self.notifier.as_ref(),
            &trip,
            TripStatus::Cancelled,
            |t| {
                if t.negotiation_status.is_open() {
                    t.negotiation_status = NegotiationStatus::Rejected;
                }
                t.payment_state = if refund {
                    PaymentState::Refunded
                } else if t.payment_state == PaymentState::AwaitingPayment {
                    PaymentState::Failed
                } else {
                    t.payment_state
                };
            },
        )
        .await?;
        info!(%trip_id, by = %by, payment = cancelled.payment_state.as_str(), "trip cancelled");

        if refund {
            self.reconciler.ensure_refund(&cancelled).await?;
        }
        Ok(cancelled)
    }

    /// Rejects the pending offer of a trip still in negotiation so no
    /// approval can land after the cancellation. An offer that was accepted
    /// first wins: the approval is finishing and the cancel is refused.
    async fn close_open_offer(&self, trip: &Trip) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let log = self.trips.negotiations(trip.id).await?;
            let Some(newest) = log.last() else {
                return Ok(());
            };
            match newest.outcome {
                OfferOutcome::Pending => {
                    if self
                        .trips
                        .resolve_negotiation_if(trip.id, newest.id, OfferOutcome::Rejected)
                        .await?
                    {
                        debug!(trip_id = %trip.id, offer = %newest.id, "open offer closed by cancellation");
                        return Ok(());
                    }
                }
                OfferOutcome::Accepted => {
                    return Err(TripError::Conflict(format!(
                        "trip {} is being approved; reload and cancel again",
                        trip.id
                    )));
                }
                OfferOutcome::Rejected | OfferOutcome::Superseded => return Ok(()),
            }
        }
        Err(TripError::Conflict(format!(
            "could not close the open offer on trip {}",
            trip.id
        )))
    }
}
