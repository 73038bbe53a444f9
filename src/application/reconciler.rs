//! Payment reconciliation.
//!
//! Collections, payouts and refunds are opened here and settled from two
//! independent channels: gateway callbacks ([`PaymentReconciler::report_outcome`])
//! and active polling ([`PaymentReconciler::poll_outcome`]). Both channels
//! race through the same conditional settle, so a movement is settled and
//! its balance delta applied exactly once however many reports arrive.

use super::{MAX_CAS_ATTEMPTS, load_trip, notify_parties};
use crate::domain::events::TripEvent;
use crate::domain::ids::{TripId, UserId};
use crate::domain::money::{FeePolicy, Money};
use crate::domain::movement::{
    BalanceDelta, Direction, MoneyMovement, MovementSlot, MovementState, Outcome,
};
use crate::domain::ports::{
    GatewayHandle, GatewayStatus, MoneyStoreHandle, NotifierHandle, TripStoreHandle,
};
use crate::domain::trip::{PaymentState, Trip, TripKind, TripStatus};
use crate::error::{Result, TripError};
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What cancelling found on the trip's collection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionVoid {
    /// No collection was pending.
    Nothing,
    /// The pending collection was failed before the payer completed it.
    Voided,
    /// The payer completed the collection first.
    AlreadyPaid,
}

pub struct PaymentReconciler {
    trips: TripStoreHandle,
    money: MoneyStoreHandle,
    gateway: GatewayHandle,
    notifier: NotifierHandle,
    fee_policy: FeePolicy,
    gateway_timeout: Duration,
}

impl PaymentReconciler {
    pub fn new(
        trips: TripStoreHandle,
        money: MoneyStoreHandle,
        gateway: GatewayHandle,
        notifier: NotifierHandle,
        fee_policy: FeePolicy,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            trips,
            money,
            gateway,
            notifier,
            fee_policy,
            gateway_timeout,
        }
    }

    pub fn fee_policy(&self) -> &FeePolicy {
        &self.fee_policy
    }

    async fn gateway_call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.gateway_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TripError::GatewayUnavailable(format!(
                "no answer within {}ms",
                self.gateway_timeout.as_millis()
            ))),
        }
    }

    /// Opens the trip's single pending collection for `amount`, or returns
    /// the one already open.
    pub async fn open_collection(&self, trip_id: TripId, amount: Money) -> Result<MoneyMovement> {
        if !amount.is_positive() {
            return Err(TripError::Validation(
                "collection amount must be positive".to_string(),
            ));
        }
        let trip = load_trip(self.trips.as_ref(), trip_id).await?;
        if trip.status.is_terminal() {
            return Err(TripError::Conflict(format!(
                "trip {trip_id} is {} and takes no payment",
                trip.status
            )));
        }
        let provider = trip.provider()?.clone();

        let movement = MoneyMovement::pending(Some(trip_id), provider, Direction::Collect, amount);
        match self.money.open_movement_unique(movement, None).await? {
            MovementSlot::Opened(movement) => {
                info!(%trip_id, movement_id = %movement.id, %amount, "collection opened");
                self.mark_awaiting_payment(trip_id).await?;
                self.notifier.publish(
                    &trip.requester_id,
                    TripEvent::PaymentRequested { trip_id, amount },
                );
                Ok(movement)
            }
            MovementSlot::Pending(movement) => {
                debug!(%trip_id, movement_id = %movement.id, "collection already open");
                self.mark_awaiting_payment(trip_id).await?;
                Ok(movement)
            }
            MovementSlot::Settled(movement) => Err(TripError::Conflict(format!(
                "trip {trip_id} was already paid by {}",
                movement.id
            ))),
        }
    }

    async fn mark_awaiting_payment(&self, trip_id: TripId) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let trip = load_trip(self.trips.as_ref(), trip_id).await?;
            if trip.payment_state != PaymentState::Unbilled {
                return Ok(());
            }
            let mut updated = trip.clone();
            updated.payment_state = PaymentState::AwaitingPayment;
            if self.trips.save_trip_if(&updated, trip.status).await?.is_some() {
                return Ok(());
            }
        }
        Err(TripError::Conflict(format!(
            "could not mark trip {trip_id} as awaiting payment"
        )))
    }

    /// Starts a gateway charge against `payer_contact` for the trip's
    /// agreed price. Calling again while the charge is pending returns the
    /// same movement without charging twice.
    pub async fn start_collection(
        &self,
        trip_id: TripId,
        payer_contact: &str,
    ) -> Result<MoneyMovement> {
        let trip = load_trip(self.trips.as_ref(), trip_id).await?;
        if !matches!(
            trip.status,
            TripStatus::PaymentDue | TripStatus::Scheduled | TripStatus::HandoverPending
        ) {
            return Err(TripError::Conflict(format!(
                "trip {trip_id} has no payment due while {}",
                trip.status
            )));
        }
        if trip.payment_state == PaymentState::Paid {
            return Err(TripError::Conflict(format!("trip {trip_id} is already paid")));
        }
        let amount = trip.billable_amount()?;

        let mut movement = self.open_collection(trip_id, amount).await?;
        if movement.external_reference.is_some() {
            return Ok(movement);
        }

        let reference = self
            .gateway_call(self.gateway.initiate_collection(payer_contact, amount))
            .await?;
        if self.money.attach_reference(movement.id, &reference).await? {
            info!(%trip_id, movement_id = %movement.id, %reference, "charge started");
            movement.external_reference = Some(reference);
            return Ok(movement);
        }

        warn!(%trip_id, %reference, "another charge was attached first, this one is orphaned");
        self.money
            .load_movement(movement.id)
            .await?
            .ok_or_else(|| TripError::not_found("movement", movement.id))
    }

    /// Asks the gateway for the state of `reference` and applies a final
    /// answer. A `Pending` answer leaves the movement untouched.
    pub async fn poll_outcome(&self, reference: &str) -> Result<MoneyMovement> {
        let movement = self.movement_by_ref(reference).await?;
        if movement.state.is_settled() {
            return Ok(movement);
        }
        let verification = self.gateway_call(self.gateway.verify(reference)).await?;
        let amount = verification.amount.unwrap_or(movement.amount);
        match verification.status {
            GatewayStatus::Pending => {
                debug!(%reference, "still pending at gateway");
                Ok(movement)
            }
            GatewayStatus::Success => self.report_outcome(reference, Outcome::Success, amount).await,
            GatewayStatus::Failed => self.report_outcome(reference, Outcome::Failed, amount).await,
        }
    }

    /// Applies a final outcome for the movement behind `reference`.
    ///
    /// Duplicates and reports that lose the race to the other channel are
    /// no-ops that return the settled movement.
    pub async fn report_outcome(
        &self,
        reference: &str,
        outcome: Outcome,
        amount: Money,
    ) -> Result<MoneyMovement> {
        let movement = self.movement_by_ref(reference).await?;
        if movement.state.is_settled() {
            debug!(%reference, state = ?movement.state, "duplicate outcome ignored");
            self.repair_collection(&movement).await?;
            return Ok(movement);
        }

        let outcome = if outcome == Outcome::Success && amount < movement.amount {
            warn!(%reference, expected = %movement.amount, %amount, "underpayment recorded as failure");
            Outcome::Failed
        } else {
            outcome
        };

        let delta = match (movement.direction, outcome) {
            (Direction::Collect, Outcome::Success) => Some(BalanceDelta::credit(
                movement.account.clone(),
                self.fee_policy.provider_credit(movement.amount),
            )),
            // Reverses the debit taken when the payout was requested.
            (Direction::Payout, Outcome::Failed) => Some(BalanceDelta::credit(
                movement.account.clone(),
                movement.amount,
            )),
            // Reverses the provider debit taken when the refund was opened.
            (Direction::Refund, Outcome::Failed) => Some(BalanceDelta::credit(
                movement.account.clone(),
                self.fee_policy.provider_credit(movement.amount),
            )),
            _ => None,
        };
        let credited = delta.as_ref().map(|d| d.delta);

        let won = self
            .money
            .settle_movement_if(
                movement.id,
                MovementState::Pending,
                outcome.target_state(),
                delta,
            )
            .await?;
        let settled = self
            .money
            .load_movement(movement.id)
            .await?
            .ok_or_else(|| TripError::not_found("movement", movement.id))?;
        if !won {
            debug!(%reference, state = ?settled.state, "outcome already applied by the other channel");
            self.repair_collection(&settled).await?;
            return Ok(settled);
        }

        info!(%reference, direction = ?settled.direction, state = ?settled.state, "movement settled");
        match (settled.direction, outcome) {
            (Direction::Collect, Outcome::Success) => {
                if let (Some(trip_id), Some(amount)) = (settled.trip_id, credited) {
                    self.notifier
                        .publish(&settled.account, TripEvent::BalanceCredited { trip_id, amount });
                }
                self.apply_collection(&settled).await?;
            }
            (Direction::Collect, Outcome::Failed) => {
                if let Some(trip_id) = settled.trip_id {
                    let trip = load_trip(self.trips.as_ref(), trip_id).await?;
                    self.notifier
                        .publish(&trip.requester_id, TripEvent::PaymentFailed { trip_id });
                }
            }
            (Direction::Payout, Outcome::Success) => {
                self.notifier.publish(
                    &settled.account,
                    TripEvent::PayoutCompleted {
                        movement_id: settled.id,
                        amount: settled.amount,
                    },
                );
            }
            (Direction::Payout, Outcome::Failed) => {
                warn!(movement_id = %settled.id, account = %settled.account, "payout failed, balance restored");
                self.notifier.publish(
                    &settled.account,
                    TripEvent::PayoutFailed {
                        movement_id: settled.id,
                        amount: settled.amount,
                    },
                );
            }
            (Direction::Refund, Outcome::Success) => {}
            (Direction::Refund, Outcome::Failed) => {
                error!(
                    movement_id = %settled.id,
                    trip_id = ?settled.trip_id,
                    amount = %settled.amount,
                    "refund payout failed, provider debit reversed; cancel again to retry"
                );
            }
        }
        Ok(settled)
    }

    /// Brings the trip up to date with a completed collection whose trip
    /// update was lost.
    async fn repair_collection(&self, movement: &MoneyMovement) -> Result<()> {
        if movement.direction == Direction::Collect && movement.state == MovementState::Completed {
            self.apply_collection(movement).await?;
        }
        Ok(())
    }

    /// Marks the trip paid and advances it past its payment gate. A
    /// payment that lands on a cancelled trip is refunded.
    async fn apply_collection(&self, movement: &MoneyMovement) -> Result<Option<Trip>> {
        let Some(trip_id) = movement.trip_id else {
            return Ok(None);
        };

        for _ in 0..MAX_CAS_ATTEMPTS {
            let trip = load_trip(self.trips.as_ref(), trip_id).await?;
            if matches!(trip.payment_state, PaymentState::Paid | PaymentState::Refunded) {
                return Ok(Some(trip));
            }

            let mut updated = trip.clone();
            if trip.status == TripStatus::Cancelled {
                updated.payment_state = PaymentState::Refunded;
                if let Some(saved) = self.trips.save_trip_if(&updated, trip.status).await? {
                    warn!(%trip_id, "payment arrived after cancellation, refunding");
                    self.ensure_refund(&saved).await?;
                    return Ok(Some(saved));
                }
                continue;
            }

            updated.payment_state = PaymentState::Paid;
            let next = match (trip.kind, trip.status) {
                (TripKind::SharedRide, TripStatus::PaymentDue) => Some(TripStatus::Completed),
                (TripKind::ExclusiveHire, TripStatus::HandoverPending) => Some(TripStatus::Active),
                _ => None,
            };
            if let Some(next) = next {
                updated.status = next;
                if next == TripStatus::Completed {
                    updated.completed_at = Some(Utc::now());
                }
            }

            let Some(saved) = self.trips.save_trip_if(&updated, trip.status).await? else {
                debug!(%trip_id, "trip changed while applying payment, retrying");
                continue;
            };
            info!(%trip_id, amount = %movement.amount, status = %saved.status, "trip paid");
            notify_parties(
                self.notifier.as_ref(),
                &saved,
                TripEvent::PaymentReceived {
                    trip_id,
                    amount: movement.amount,
                },
            );
            if let Some(to) = next {
                notify_parties(
                    self.notifier.as_ref(),
                    &saved,
                    TripEvent::StatusChanged {
                        trip_id,
                        from: trip.status,
                        to,
                    },
                );
            }
            return Ok(Some(saved));
        }

        Err(TripError::Conflict(format!(
            "could not record payment on trip {trip_id}"
        )))
    }

    /// Fails the trip's pending collection, if any, ahead of cancellation.
    pub async fn void_pending_collection(&self, trip: &Trip) -> Result<CollectionVoid> {
        let movements = self.money.movements_for_trip(trip.id).await?;
        let collections = movements.iter().filter(|m| m.direction == Direction::Collect);

        let mut result = CollectionVoid::Nothing;
        for movement in collections {
            match movement.state {
                MovementState::Completed => return Ok(CollectionVoid::AlreadyPaid),
                MovementState::Failed => {}
                MovementState::Pending => {
                    if self
                        .money
                        .settle_movement_if(
                            movement.id,
                            MovementState::Pending,
                            MovementState::Failed,
                            None,
                        )
                        .await?
                    {
                        info!(trip_id = %trip.id, movement_id = %movement.id, "pending collection voided");
                        result = CollectionVoid::Voided;
                        continue;
                    }
                    let current = self
                        .money
                        .load_movement(movement.id)
                        .await?
                        .ok_or_else(|| TripError::not_found("movement", movement.id))?;
                    if current.state == MovementState::Completed {
                        // The payer won the race: make sure the trip shows it.
                        self.apply_collection(&current).await?;
                        return Ok(CollectionVoid::AlreadyPaid);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Opens the trip's refund, or drives the one already open.
    ///
    /// The provider's credited share is debited when the refund is opened,
    /// in the same atomic step; the full collected amount is then paid out
    /// to the requester. A refund the gateway failed has its debit reversed
    /// and frees the slot, so calling this again opens a fresh one.
    pub async fn ensure_refund(&self, trip: &Trip) -> Result<MoneyMovement> {
        let provider = trip.provider()?.clone();
        let movements = self.money.movements_for_trip(trip.id).await?;
        let Some(collected) = movements
            .iter()
            .find(|m| m.direction == Direction::Collect && m.state == MovementState::Completed)
        else {
            return Err(TripError::Conflict(format!(
                "trip {} has no completed payment to refund",
                trip.id
            )));
        };

        let amount = collected.amount;
        let share = self.fee_policy.provider_credit(amount);
        let refund = MoneyMovement::pending(Some(trip.id), provider.clone(), Direction::Refund, amount);
        let mut movement = match self
            .money
            .open_movement_unique(refund, Some(BalanceDelta::debit(provider, share)))
            .await?
        {
            MovementSlot::Opened(movement) => {
                info!(trip_id = %trip.id, movement_id = %movement.id, %amount, "refund opened");
                self.notifier.publish(
                    &trip.requester_id,
                    TripEvent::Refunded {
                        trip_id: trip.id,
                        amount,
                    },
                );
                movement
            }
            MovementSlot::Pending(movement) if movement.external_reference.is_none() => movement,
            MovementSlot::Pending(movement) | MovementSlot::Settled(movement) => return Ok(movement),
        };

        let reference = self
            .gateway_call(
                self.gateway
                    .initiate_payout(trip.requester_id.as_str(), amount),
            )
            .await
            .inspect_err(|e| {
                warn!(trip_id = %trip.id, error = %e, "refund payout not sent, cancel again to retry");
            })?;
        if self.money.attach_reference(movement.id, &reference).await? {
            movement.external_reference = Some(reference);
        }
        Ok(movement)
    }

    /// Withdraws `amount` of the provider's balance to `payee_contact`.
    ///
    /// The balance is debited before the gateway is called. If the gateway
    /// errors or times out, the movement is failed and the debit reversed.
    pub async fn request_payout(
        &self,
        provider: &UserId,
        amount: Money,
        payee_contact: &str,
    ) -> Result<MoneyMovement> {
        if !amount.is_positive() {
            return Err(TripError::Validation("payout must be positive".to_string()));
        }
        let mut movement = MoneyMovement::pending(None, provider.clone(), Direction::Payout, amount);
        self.money
            .insert_movement(
                movement.clone(),
                Some(BalanceDelta::debit(provider.clone(), amount)),
            )
            .await?;
        info!(movement_id = %movement.id, %provider, %amount, "payout requested");

        match self
            .gateway_call(self.gateway.initiate_payout(payee_contact, amount))
            .await
        {
            Ok(reference) => {
                if self.money.attach_reference(movement.id, &reference).await? {
                    movement.external_reference = Some(reference);
                }
                Ok(movement)
            }
            Err(e) => {
                warn!(movement_id = %movement.id, error = %e, "payout not sent, reversing debit");
                let reversed = self
                    .money
                    .settle_movement_if(
                        movement.id,
                        MovementState::Pending,
                        MovementState::Failed,
                        Some(BalanceDelta::credit(provider.clone(), amount)),
                    )
                    .await?;
                if reversed {
                    self.notifier.publish(
                        provider,
                        TripEvent::PayoutFailed {
                            movement_id: movement.id,
                            amount,
                        },
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn movement_by_ref(&self, reference: &str) -> Result<MoneyMovement> {
        self.money
            .load_movement_by_ref(reference)
            .await?
            .ok_or_else(|| TripError::not_found("movement", reference))
    }

    /// The trip's most recent collection, if one was ever opened.
    pub async fn latest_collection(&self, trip_id: TripId) -> Result<Option<MoneyMovement>> {
        let movements = self.money.movements_for_trip(trip_id).await?;
        Ok(movements
            .into_iter()
            .filter(|m| m.direction == Direction::Collect)
            .max_by_key(|m| m.created_at))
    }

    pub async fn balance(&self, account: &UserId) -> Result<Money> {
        self.money.balance(account).await
    }
}
