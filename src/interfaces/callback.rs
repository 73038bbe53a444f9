//! Authenticated entry point for gateway status callbacks.
//!
//! The gateway signs the raw request body with HMAC-SHA256 under a shared
//! secret and sends the hex digest alongside it. Nothing in the body is
//! looked at until the signature checks out.

use crate::application::reconciler::PaymentReconciler;
use crate::domain::money::Money;
use crate::domain::movement::{MoneyMovement, Outcome};
use crate::domain::ports::GatewayStatus;
use crate::error::{Result, TripError};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Body of a gateway callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CallbackPayload {
    pub external_ref: String,
    pub status: GatewayStatus,
    #[serde(default)]
    pub amount: Option<Money>,
}

fn mac(secret: &[u8], body: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| TripError::Validation(format!("callback secret: {e}")))?;
    mac.update(body);
    Ok(mac)
}

/// Hex-encoded HMAC-SHA256 of `body`, as the gateway sends it.
pub fn sign_payload(secret: &[u8], body: &[u8]) -> Result<String> {
    Ok(hex::encode(mac(secret, body)?.finalize().into_bytes()))
}

pub struct CallbackHandler {
    secret: Vec<u8>,
    reconciler: Arc<PaymentReconciler>,
}

impl CallbackHandler {
    pub fn new(secret: impl Into<Vec<u8>>, reconciler: Arc<PaymentReconciler>) -> Self {
        Self {
            secret: secret.into(),
            reconciler,
        }
    }

    /// Checks `signature_hex` against `raw_body`, then feeds the reported
    /// outcome to the reconciler. A `pending` status changes nothing.
    pub async fn handle(&self, raw_body: &[u8], signature_hex: &str) -> Result<MoneyMovement> {
        let Ok(signature) = hex::decode(signature_hex.trim()) else {
            warn!("callback signature is not hex");
            return Err(TripError::SignatureInvalid);
        };
        if mac(&self.secret, raw_body)?.verify_slice(&signature).is_err() {
            warn!("callback signature mismatch");
            return Err(TripError::SignatureInvalid);
        }

        let payload: CallbackPayload = serde_json::from_slice(raw_body)?;
        debug!(reference = %payload.external_ref, status = ?payload.status, "callback accepted");

        let movement = self
            .reconciler
            .movement_by_ref(&payload.external_ref)
            .await?;
        let amount = payload.amount.unwrap_or(movement.amount);
        let outcome = match payload.status {
            GatewayStatus::Pending => return Ok(movement),
            GatewayStatus::Success => Outcome::Success,
            GatewayStatus::Failed => Outcome::Failed,
        };
        self.reconciler
            .report_outcome(&payload.external_ref, outcome, amount)
            .await
    }
}
