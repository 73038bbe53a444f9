use super::{MAX_CAS_ATTEMPTS, load_trip, notify_parties, transition};
use crate::domain::events::TripEvent;
use crate::domain::ids::{TripId, UserId};
use crate::domain::money::Money;
use crate::domain::negotiation::{NegotiationRecord, OfferOutcome};
use crate::domain::ports::{NotifierHandle, TripStoreHandle};
use crate::domain::trip::{NegotiationStatus, NewTrip, Party, Trip, TripKind, TripStatus};
use crate::error::{Result, TripError};
use chrono::Utc;
use tracing::{debug, info, warn};

/// Mediates offers and counter-offers until a trip is approved or rejected.
pub struct NegotiationEngine {
    trips: TripStoreHandle,
    notifier: NotifierHandle,
}

impl NegotiationEngine {
    pub fn new(trips: TripStoreHandle, notifier: NotifierHandle) -> Self {
        Self { trips, notifier }
    }

    /// Creates a trip and records the requester's initial price as the
    /// opening offer.
    pub async fn create_trip(&self, input: NewTrip) -> Result<Trip> {
        let message = input.message.clone();
        let trip = Trip::new(input)?;
        self.trips.insert_trip(trip.clone()).await?;

        let opening = NegotiationRecord::pending(
            trip.id,
            trip.requester_id.clone(),
            trip.initial_price,
            message,
        );
        if self.trips.append_negotiation(opening, None).await?.is_none() {
            return Err(TripError::Conflict(format!(
                "trip {} already has a negotiation log",
                trip.id
            )));
        }

        info!(trip_id = %trip.id, kind = trip.kind.as_str(), price = %trip.initial_price, "trip created");
        if let Some(provider) = &trip.provider_id {
            self.notifier.publish(
                provider,
                TripEvent::OfferProposed {
                    trip_id: trip.id,
                    by: trip.requester_id.clone(),
                    price: trip.initial_price,
                },
            );
        }
        Ok(trip)
    }

    /// Assigns the provider who takes up an open request.
    pub async fn assign_provider(&self, trip_id: TripId, provider: &UserId) -> Result<Trip> {
        let trip = load_trip(self.trips.as_ref(), trip_id).await?;
        if *provider == trip.requester_id {
            return Err(TripError::Validation(
                "requester cannot be their own provider".to_string(),
            ));
        }
        match &trip.provider_id {
            Some(current) if current == provider => return Ok(trip),
            Some(current) => {
                return Err(TripError::Conflict(format!(
                    "trip {trip_id} is already assigned to {current}"
                )));
            }
            None => {}
        }
        if trip.status != TripStatus::Requested || !trip.negotiation_status.is_open() {
            return Err(TripError::Conflict(format!(
                "trip {trip_id} is no longer open for assignment"
            )));
        }

        let mut updated = trip.clone();
        updated.provider_id = Some(provider.clone());
        let Some(saved) = self
            .trips
            .save_trip_if(&updated, TripStatus::Requested)
            .await?
        else {
            let actual = load_trip(self.trips.as_ref(), trip_id).await?.status;
            return Err(TripError::StaleState {
                expected: TripStatus::Requested,
                actual,
            });
        };

        info!(%trip_id, %provider, "provider assigned");
        self.notifier.publish(
            &saved.requester_id,
            TripEvent::ProviderAssigned {
                trip_id,
                provider_id: provider.clone(),
            },
        );
        Ok(saved)
    }

    /// Records a new offer from either party.
    ///
    /// The newest pending offer is superseded. If the newest offer was
    /// already accepted or rejected, the proposal fails with `Conflict`.
    pub async fn propose(
        &self,
        trip_id: TripId,
        by: &UserId,
        price: Money,
        message: Option<String>,
    ) -> Result<NegotiationRecord> {
        if !price.is_positive() {
            return Err(TripError::Validation("offer must be positive".to_string()));
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let trip = load_trip(self.trips.as_ref(), trip_id).await?;
            let Some(party) = trip.party_of(by) else {
                return Err(TripError::forbidden(by, "make an offer on this trip"));
            };
            if !trip.negotiation_status.is_open() || trip.status != TripStatus::Requested {
                return Err(TripError::Conflict(format!(
                    "negotiation on trip {trip_id} is closed"
                )));
            }

            let log = self.trips.negotiations(trip_id).await?;
            let newest = log.last();
            if let Some(newest) = newest
                && newest.outcome.is_final()
            {
                return Err(TripError::Conflict(format!(
                    "offer {} on trip {trip_id} is already {:?}",
                    newest.id, newest.outcome
                )));
            }

            let record = NegotiationRecord::pending(trip_id, by.clone(), price, message.clone());
            let Some(stored) = self
                .trips
                .append_negotiation(record, newest.map(|r| r.id))
                .await?
            else {
                debug!(%trip_id, "concurrent offer appended first, retrying");
                continue;
            };

            self.sync_offer(trip_id).await?;

            info!(%trip_id, by = %by, %price, seq = stored.seq, "offer proposed");
            let counterparty = match party {
                Party::Requester => trip.provider_id.as_ref(),
                Party::Provider => Some(&trip.requester_id),
            };
            if let Some(counterparty) = counterparty {
                self.notifier.publish(
                    counterparty,
                    TripEvent::OfferProposed {
                        trip_id,
                        by: by.clone(),
                        price,
                    },
                );
            }
            return Ok(stored);
        }

        Err(TripError::Conflict(format!(
            "offer on trip {trip_id} kept losing to concurrent offers"
        )))
    }

    /// Copies the newest pending offer onto the trip row.
    async fn sync_offer(&self, trip_id: TripId) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let trip = load_trip(self.trips.as_ref(), trip_id).await?;
            if !trip.negotiation_status.is_open() {
                return Ok(());
            }
            let log = self.trips.negotiations(trip_id).await?;
            let Some(newest) = log.last().filter(|r| r.is_pending()) else {
                return Ok(());
            };
            let status = if log.len() == 1 {
                NegotiationStatus::Proposed
            } else {
                NegotiationStatus::Negotiating
            };
            if trip.offered_price == Some(newest.price) && trip.negotiation_status == status {
                return Ok(());
            }

            let mut updated = trip.clone();
            updated.offered_price = Some(newest.price);
            updated.negotiation_status = status;
            if self.trips.save_trip_if(&updated, trip.status).await?.is_some() {
                return Ok(());
            }
        }
        Err(TripError::Conflict(format!(
            "could not record offer on trip {trip_id}"
        )))
    }

    /// Accepts the newest pending offer at `price`.
    ///
    /// The accepting party must be the counterparty of that offer. Once the
    /// trip is approved, repeated calls at the agreed price return the
    /// current trip unchanged.
    pub async fn approve(&self, trip_id: TripId, by: &UserId, price: Money) -> Result<Trip> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let trip = load_trip(self.trips.as_ref(), trip_id).await?;
            if trip.party_of(by).is_none() {
                return Err(TripError::forbidden(by, "approve this trip"));
            }
            if trip.negotiation_status == NegotiationStatus::Approved {
                if trip.agreed_price != Some(price) {
                    return Err(TripError::Conflict(format!(
                        "trip {trip_id} was already approved at a different price"
                    )));
                }
                debug!(%trip_id, "already approved");
                return self.finish_approval(trip).await;
            }
            if trip.provider_id.is_none() {
                return Err(TripError::Validation(format!(
                    "trip {trip_id} has no assigned provider yet"
                )));
            }

            let log = self.trips.negotiations(trip_id).await?;
            if trip.status != TripStatus::Requested || !trip.negotiation_status.is_open() {
                if let Some(newest) = log.last()
                    && newest.outcome == OfferOutcome::Accepted
                {
                    warn!(%trip_id, offer = %newest.id, status = %trip.status, "accepted offer lost to a concurrent update");
                }
                return Err(TripError::Conflict(format!(
                    "trip {trip_id} can no longer be approved"
                )));
            }
            let Some(newest) = log.last() else {
                return Err(TripError::Conflict(format!(
                    "trip {trip_id} has no offer to approve"
                )));
            };
            if newest.price != price {
                return Err(TripError::Conflict(format!(
                    "offer on the table is {}, not {price}",
                    newest.price
                )));
            }
            match newest.outcome {
                OfferOutcome::Pending => {
                    if newest.proposed_by == *by {
                        return Err(TripError::forbidden(by, "accept their own offer"));
                    }
                    if !self
                        .trips
                        .resolve_negotiation_if(trip_id, newest.id, OfferOutcome::Accepted)
                        .await?
                    {
                        debug!(%trip_id, "offer changed under approval, retrying");
                        continue;
                    }
                }
                // An earlier approval accepted the offer but did not finish
                // updating the trip.
                OfferOutcome::Accepted => {}
                OfferOutcome::Rejected | OfferOutcome::Superseded => {
                    return Err(TripError::Conflict(format!(
                        "offer {} is {:?}",
                        newest.id, newest.outcome
                    )));
                }
            }

            let mut updated = trip.clone();
            updated.agreed_price = Some(price);
            updated.offered_price = Some(price);
            updated.negotiation_status = NegotiationStatus::Approved;
            updated.status = TripStatus::Approved;
            updated.approved_at = Some(Utc::now());
            let Some(saved) = self
                .trips
                .save_trip_if(&updated, TripStatus::Requested)
                .await?
            else {
                debug!(%trip_id, "trip changed under approval, retrying");
                continue;
            };

            info!(%trip_id, %price, by = %by, "trip approved");
            notify_parties(
                self.notifier.as_ref(),
                &saved,
                TripEvent::Approved { trip_id, price },
            );
            return self.finish_approval(saved).await;
        }

        Err(TripError::Conflict(format!(
            "approval of trip {trip_id} kept losing to concurrent updates"
        )))
    }

    /// Moves an approved hire on to the payment-choice step.
    async fn finish_approval(&self, trip: Trip) -> Result<Trip> {
        if trip.kind != TripKind::ExclusiveHire || trip.status != TripStatus::Approved {
            return Ok(trip);
        }
        match transition(
            self.trips.as_ref(),
            self.notifier.as_ref(),
            &trip,
            TripStatus::AwaitingPaymentChoice,
            |_| {},
        )
        .await
        {
            Ok(saved) => Ok(saved),
            Err(TripError::StaleState { .. }) => load_trip(self.trips.as_ref(), trip.id).await,
            Err(e) => Err(e),
        }
    }

    /// Declines the trip. Only the assigned provider may reject.
    pub async fn reject(&self, trip_id: TripId, by: &UserId) -> Result<Trip> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let trip = load_trip(self.trips.as_ref(), trip_id).await?;
            trip.require_provider(by, "reject this trip")?;
            if trip.negotiation_status == NegotiationStatus::Rejected {
                return Ok(trip);
            }
            if trip.status != TripStatus::Requested || !trip.negotiation_status.is_open() {
                return Err(TripError::Conflict(format!(
                    "trip {trip_id} can no longer be rejected"
                )));
            }

            let log = self.trips.negotiations(trip_id).await?;
            if let Some(newest) = log.last().filter(|r| r.is_pending())
                && !self
                    .trips
                    .resolve_negotiation_if(trip_id, newest.id, OfferOutcome::Rejected)
                    .await?
            {
                continue;
            }

            let mut updated = trip.clone();
            updated.negotiation_status = NegotiationStatus::Rejected;
            updated.status = TripStatus::Cancelled;
            let Some(saved) = self
                .trips
                .save_trip_if(&updated, TripStatus::Requested)
                .await?
            else {
                continue;
            };

            info!(%trip_id, by = %by, "trip rejected");
            notify_parties(
                self.notifier.as_ref(),
                &saved,
                TripEvent::Rejected { trip_id },
            );
            return Ok(saved);
        }

        Err(TripError::Conflict(format!(
            "rejection of trip {trip_id} kept losing to concurrent updates"
        )))
    }

    pub async fn history(&self, trip_id: TripId) -> Result<Vec<NegotiationRecord>> {
        self.trips.negotiations(trip_id).await
    }
}
