use crate::domain::money::FeePolicy;
use std::time::Duration;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime settings shared by the engines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Upper bound on a single ledger store call.
    pub store_timeout: Duration,
    /// Upper bound on a single gateway call.
    pub gateway_timeout: Duration,
    pub fee_policy: FeePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            gateway_timeout: DEFAULT_GATEWAY_TIMEOUT,
            fee_policy: FeePolicy::default(),
        }
    }
}
