use crate::domain::money::Money;
use crate::domain::ports::{GatewayStatus, PaymentGateway, Verification};
use crate::error::{Result, TripError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct Charge {
    amount: Money,
    status: GatewayStatus,
}

/// An in-process mobile-money gateway.
///
/// Charges stay `Pending` until [`SandboxGateway::set_outcome`] settles them,
/// which stands in for the payer approving the prompt on their phone.
/// Payouts settle immediately unless payouts are switched to failing.
#[derive(Clone, Default)]
pub struct SandboxGateway {
    charges: Arc<RwLock<HashMap<String, Charge>>>,
    next_ref: Arc<AtomicU64>,
    fail_payouts: Arc<AtomicBool>,
    offline: Arc<AtomicBool>,
    latency: Option<Duration>,
    namespace: Option<String>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call, for exercising caller timeouts.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Tags references as `SBX-{namespace}-000001` so runs that share a
    /// database never reuse a reference.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn fail_payouts(&self, fail: bool) {
        self.fail_payouts.store(fail, Ordering::SeqCst);
    }

    /// Makes every call fail as if the gateway were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Settles a pending charge. Returns the amount charged, or `None` for
    /// an unknown reference.
    pub async fn set_outcome(&self, external_ref: &str, status: GatewayStatus) -> Option<Money> {
        let mut charges = self.charges.write().await;
        let charge = charges.get_mut(external_ref)?;
        charge.status = status;
        Some(charge.amount)
    }

    async fn call(&self) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(TripError::GatewayUnavailable("sandbox offline".to_string()));
        }
        Ok(())
    }

    fn reference(&self) -> String {
        let n = self.next_ref.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.namespace {
            Some(ns) => format!("SBX-{ns}-{n:06}"),
            None => format!("SBX-{n:06}"),
        }
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn initiate_collection(&self, payer_contact: &str, amount: Money) -> Result<String> {
        self.call().await?;
        let reference = self.reference();
        debug!(%reference, payer_contact, %amount, "sandbox charge created");
        self.charges.write().await.insert(
            reference.clone(),
            Charge {
                amount,
                status: GatewayStatus::Pending,
            },
        );
        Ok(reference)
    }

    async fn initiate_payout(&self, payee_contact: &str, amount: Money) -> Result<String> {
        self.call().await?;
        if self.fail_payouts.load(Ordering::SeqCst) {
            return Err(TripError::GatewayUnavailable(format!(
                "payout to {payee_contact} declined"
            )));
        }
        let reference = self.reference();
        debug!(%reference, payee_contact, %amount, "sandbox payout sent");
        self.charges.write().await.insert(
            reference.clone(),
            Charge {
                amount,
                status: GatewayStatus::Success,
            },
        );
        Ok(reference)
    }

    async fn verify(&self, external_ref: &str) -> Result<Verification> {
        self.call().await?;
        let charges = self.charges.read().await;
        let charge = charges
            .get(external_ref)
            .ok_or_else(|| TripError::not_found("charge", external_ref))?;
        Ok(Verification {
            status: charge.status,
            amount: Some(charge.amount),
        })
    }
}
