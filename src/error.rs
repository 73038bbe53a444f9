use crate::domain::trip::TripStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TripError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{actor} may not {action}")]
    Forbidden { actor: String, action: &'static str },
    #[error("stale state: expected {expected:?}, found {actual:?}")]
    StaleState {
        expected: TripStatus,
        actual: TripStatus,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("callback signature mismatch")]
    SignatureInvalid,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },
    #[error("ledger store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TripError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn forbidden(actor: impl ToString, action: &'static str) -> Self {
        Self::Forbidden {
            actor: actor.to_string(),
            action,
        }
    }

    /// Errors the caller may recover from by reloading and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StaleState { .. } | Self::GatewayUnavailable(_) | Self::StoreUnavailable(_)
        )
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for TripError {
    fn from(e: rocksdb::Error) -> Self {
        Self::Internal(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, TripError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(
            TripError::StaleState {
                expected: TripStatus::Approved,
                actual: TripStatus::Inbound,
            }
            .is_retryable()
        );
        assert!(TripError::GatewayUnavailable("timeout".into()).is_retryable());
        assert!(TripError::StoreUnavailable("timeout".into()).is_retryable());
        assert!(!TripError::SignatureInvalid.is_retryable());
        assert!(!TripError::Conflict("dup".into()).is_retryable());
        assert!(!TripError::not_found("trip", "x").is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = TripError::forbidden("bob", "approve");
        assert_eq!(err.to_string(), "bob may not approve");

        let err = TripError::not_found("movement", "SBX-1");
        assert_eq!(err.to_string(), "movement not found: SBX-1");
    }
}
