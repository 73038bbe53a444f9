use super::callback::{CallbackHandler, CallbackPayload, sign_payload};
use super::csv::command_reader::{Command, CommandKind};
use crate::application::engine::TripEngine;
use crate::domain::ids::{TripId, UserId};
use crate::domain::money::Money;
use crate::domain::ports::GatewayStatus;
use crate::domain::trip::{NewTrip, PaymentTiming, Trip, TripKind};
use crate::error::{Result, TripError};
use crate::infrastructure::sandbox_gateway::SandboxGateway;
use std::collections::HashMap;
use tracing::debug;

/// Replays scripted commands against a [`TripEngine`] wired to a
/// [`SandboxGateway`].
///
/// Trip labels in the script map to generated ids. Gateway-side actions
/// (`gateway_settle`, `callback`) act on the trip's latest collection.
pub struct ScenarioRunner {
    engine: TripEngine,
    gateway: SandboxGateway,
    callbacks: CallbackHandler,
    secret: Vec<u8>,
    labels: HashMap<String, TripId>,
}

impl ScenarioRunner {
    pub fn new(engine: TripEngine, gateway: SandboxGateway, secret: impl Into<Vec<u8>>) -> Self {
        let secret = secret.into();
        let callbacks = CallbackHandler::new(secret.clone(), engine.reconciler().clone());
        Self {
            engine,
            gateway,
            callbacks,
            secret,
            labels: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &TripEngine {
        &self.engine
    }

    pub fn trip_id(&self, label: &str) -> Result<TripId> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| TripError::not_found("trip label", label))
    }

    async fn latest_reference(&self, trip_id: TripId) -> Result<String> {
        self.engine
            .reconciler()
            .latest_collection(trip_id)
            .await?
            .and_then(|m| m.external_reference)
            .ok_or_else(|| TripError::Conflict(format!("no charge started for trip {trip_id}")))
    }

    async fn create(&mut self, cmd: &Command, kind: TripKind) -> Result<()> {
        if self.labels.contains_key(&cmd.trip) {
            return Err(TripError::Conflict(format!(
                "trip label {} already used",
                cmd.trip
            )));
        }
        let (provider_id, total_passengers) = match kind {
            TripKind::SharedRide => {
                let passengers = match cmd.detail.as_deref().filter(|d| !d.is_empty()) {
                    Some(d) => Some(d.parse::<u32>().map_err(|_| {
                        TripError::Validation(format!("passenger count {d} is not a number"))
                    })?),
                    None => None,
                };
                (None, passengers)
            }
            TripKind::ExclusiveHire => (Some(UserId::new(cmd.detail()?)), None),
        };
        let trip = self
            .engine
            .negotiation()
            .create_trip(NewTrip {
                kind,
                requester_id: UserId::new(cmd.actor.as_str()),
                provider_id,
                initial_price: Money::positive(cmd.amount()?)?,
                total_passengers,
                message: None,
            })
            .await?;
        self.labels.insert(cmd.trip.clone(), trip.id);
        Ok(())
    }

    /// Applies one command. Errors leave the engine unchanged apart from
    /// whatever the failing operation already committed.
    pub async fn apply(&mut self, cmd: Command) -> Result<()> {
        debug!(command = ?cmd.command, trip = %cmd.trip, actor = %cmd.actor, "replaying");
        match cmd.command {
            CommandKind::CreateRide => return self.create(&cmd, TripKind::SharedRide).await,
            CommandKind::CreateHire => return self.create(&cmd, TripKind::ExclusiveHire).await,
            CommandKind::Payout => {
                let amount = Money::positive(cmd.amount()?)?;
                self.engine
                    .reconciler()
                    .request_payout(&UserId::new(cmd.actor.as_str()), amount, cmd.detail()?)
                    .await?;
                return Ok(());
            }
            _ => {}
        }

        let trip_id = self.trip_id(&cmd.trip)?;
        let actor = UserId::new(cmd.actor.as_str());
        let negotiation = self.engine.negotiation();
        let execution = self.engine.execution();
        let reconciler = self.engine.reconciler();

        match cmd.command {
            CommandKind::Assign => {
                negotiation.assign_provider(trip_id, &actor).await?;
            }
            CommandKind::Propose => {
                let price = Money::positive(cmd.amount()?)?;
                negotiation
                    .propose(trip_id, &actor, price, cmd.detail.clone())
                    .await?;
            }
            CommandKind::Approve => {
                negotiation
                    .approve(trip_id, &actor, Money(cmd.amount()?))
                    .await?;
            }
            CommandKind::Reject => {
                negotiation.reject(trip_id, &actor).await?;
            }
            CommandKind::Inbound => {
                execution.start_inbound(trip_id, &actor).await?;
            }
            CommandKind::Arrived => {
                execution.mark_arrived(trip_id, &actor).await?;
            }
            CommandKind::Board => {
                let count = match cmd.detail.as_deref().filter(|d| !d.is_empty()) {
                    Some(d) => d.parse::<u32>().map_err(|_| {
                        TripError::Validation(format!("boarding count {d} is not a number"))
                    })?,
                    None => 1,
                };
                execution.board_passengers(trip_id, &actor, count).await?;
            }
            CommandKind::ConfirmBoarding => {
                execution.confirm_boarding(trip_id, &actor).await?;
            }
            CommandKind::Start => {
                execution.start_trip(trip_id, &actor).await?;
            }
            CommandKind::PaymentDue => {
                execution.request_payment(trip_id, &actor).await?;
            }
            CommandKind::PayChoice => {
                let timing = match cmd.detail()? {
                    "now" => PaymentTiming::Now,
                    "pickup" | "at_pickup" => PaymentTiming::AtPickup,
                    other => {
                        return Err(TripError::Validation(format!(
                            "unknown payment timing {other}"
                        )));
                    }
                };
                execution
                    .choose_payment_timing(trip_id, &actor, timing)
                    .await?;
            }
            CommandKind::Handover => {
                execution.confirm_handover(trip_id, &actor).await?;
            }
            CommandKind::Return => {
                execution.request_return(trip_id, &actor).await?;
            }
            CommandKind::ReturnReceived => {
                execution.confirm_return_received(trip_id, &actor).await?;
            }
            CommandKind::Cancel => {
                execution.cancel(trip_id, &actor).await?;
            }
            CommandKind::Pay => {
                reconciler.start_collection(trip_id, &cmd.actor).await?;
            }
            CommandKind::GatewaySettle => {
                let status = parse_status(cmd.detail()?)?;
                let reference = self.latest_reference(trip_id).await?;
                if self.gateway.set_outcome(&reference, status).await.is_none() {
                    return Err(TripError::not_found("charge", reference));
                }
            }
            CommandKind::Poll => {
                let reference = self.latest_reference(trip_id).await?;
                reconciler.poll_outcome(&reference).await?;
            }
            CommandKind::Callback => {
                let payload = CallbackPayload {
                    external_ref: self.latest_reference(trip_id).await?,
                    status: parse_status(cmd.detail()?)?,
                    amount: cmd.amount.map(Money),
                };
                let body = serde_json::to_vec(&payload)?;
                let signature = sign_payload(&self.secret, &body)?;
                self.callbacks.handle(&body, &signature).await?;
            }
            CommandKind::CreateRide | CommandKind::CreateHire | CommandKind::Payout => {}
        }
        Ok(())
    }

    /// Every trip with the label it was created under, in creation order.
    pub async fn labelled_trips(&self) -> Result<Vec<(String, Trip)>> {
        let by_id: HashMap<TripId, &String> =
            self.labels.iter().map(|(label, id)| (*id, label)).collect();
        let trips = self.engine.report().await?.trips;
        Ok(trips
            .into_iter()
            .map(|trip| {
                let label = by_id
                    .get(&trip.id)
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| trip.id.to_string());
                (label, trip)
            })
            .collect())
    }
}

fn parse_status(value: &str) -> Result<GatewayStatus> {
    match value {
        "success" => Ok(GatewayStatus::Success),
        "failed" => Ok(GatewayStatus::Failed),
        "pending" => Ok(GatewayStatus::Pending),
        other => Err(TripError::Validation(format!(
            "unknown gateway status {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::domain::ports::Notifier;
    use crate::domain::trip::{PaymentState, TripStatus};
    use crate::infrastructure::notifier::NoopNotifier;
    use crate::interfaces::csv::command_reader::CommandReader;
    use std::sync::Arc;

    fn runner() -> ScenarioRunner {
        let gateway = SandboxGateway::new();
        let engine = TripEngine::in_memory(
            Arc::new(gateway.clone()),
            Arc::new(NoopNotifier) as Arc<dyn Notifier>,
            &EngineConfig::default(),
        );
        ScenarioRunner::new(engine, gateway, "test-secret")
    }

    async fn replay(runner: &mut ScenarioRunner, script: &str) {
        for cmd in CommandReader::new(script.as_bytes()).commands() {
            runner.apply(cmd.unwrap()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_shared_ride_script() {
        let mut runner = runner();
        replay(
            &mut runner,
            "command,trip,actor,amount,detail\n\
             create_ride,t1,alice,1000,\n\
             assign,t1,bob,,\n\
             propose,t1,bob,1200,\n\
             approve,t1,alice,1200,\n\
             inbound,t1,bob,,\n\
             arrived,t1,bob,,\n\
             confirm_boarding,t1,alice,,\n\
             start,t1,bob,,\n\
             payment_due,t1,bob,,\n\
             pay,t1,+255700000001,,\n\
             callback,t1,,1200,success\n\
             poll,t1,,,\n",
        )
        .await;

        let trip = runner.engine().trip(runner.trip_id("t1").unwrap()).await.unwrap();
        assert_eq!(trip.status, TripStatus::Completed);
        assert_eq!(trip.payment_state, PaymentState::Paid);
        assert_eq!(
            runner.engine().balance(&UserId::from("bob")).await.unwrap(),
            Money(1200)
        );
    }

    #[tokio::test]
    async fn test_unknown_label_is_not_found() {
        let mut runner = runner();
        let cmd = Command {
            command: CommandKind::Inbound,
            trip: "ghost".to_string(),
            actor: "bob".to_string(),
            amount: None,
            detail: None,
        };
        assert!(matches!(
            runner.apply(cmd).await,
            Err(TripError::NotFound { .. })
        ));
    }
}
