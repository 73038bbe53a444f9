use crate::error::{Result, TripError};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A monetary value in integer minor units (e.g. cents).
///
/// Balances may go negative when a refund reverses a credit the provider
/// has already paid out, so the representation is signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    pub const ZERO: Self = Self(0);

    pub fn minor_units(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, rhs: Self) -> Result<Self> {
        self.0
            .checked_add(rhs.0)
            .map(Self)
            .ok_or_else(|| TripError::Validation("amount overflow".to_string()))
    }

    pub fn checked_sub(self, rhs: Self) -> Result<Self> {
        self.0
            .checked_sub(rhs.0)
            .map(Self)
            .ok_or_else(|| TripError::Validation("amount underflow".to_string()))
    }

    pub fn negate(self) -> Self {
        Self(-self.0)
    }

    /// Rejects zero and negative amounts for prices and transfers.
    pub fn positive(value: i64) -> Result<Self> {
        if value > 0 {
            Ok(Self(value))
        } else {
            Err(TripError::Validation("Amount must be positive".to_string()))
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How much of a collected amount is credited to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeePolicy {
    provider_share: Decimal,
}

impl FeePolicy {
    pub fn new(provider_share: Decimal) -> Result<Self> {
        if provider_share <= Decimal::ZERO || provider_share > Decimal::ONE {
            return Err(TripError::Validation(format!(
                "provider share must be in (0, 1], got {provider_share}"
            )));
        }
        Ok(Self { provider_share })
    }

    pub fn provider_share(&self) -> Decimal {
        self.provider_share
    }

    /// Provider credit for a collected amount, rounded down to the minor unit.
    pub fn provider_credit(&self, collected: Money) -> Money {
        let share = (Decimal::from(collected.0) * self.provider_share).floor();
        Money(share.to_i64().unwrap_or(collected.0))
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            provider_share: Decimal::ONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_money_arithmetic() {
        let a = Money(1200);
        let b = Money(200);
        assert_eq!(a.checked_add(b).unwrap(), Money(1400));
        assert_eq!(a.checked_sub(b).unwrap(), Money(1000));
        assert_eq!(b.negate(), Money(-200));
        assert!(Money(i64::MAX).checked_add(Money(1)).is_err());
    }

    #[test]
    fn test_positive_amount_validation() {
        assert!(Money::positive(1).is_ok());
        assert!(matches!(Money::positive(0), Err(TripError::Validation(_))));
        assert!(matches!(Money::positive(-5), Err(TripError::Validation(_))));
    }

    #[test]
    fn test_default_policy_credits_full_price() {
        let policy = FeePolicy::default();
        assert_eq!(policy.provider_credit(Money(1200)), Money(1200));
    }

    #[test]
    fn test_partial_share_rounds_down() {
        let policy = FeePolicy::new(dec!(0.9)).unwrap();
        assert_eq!(policy.provider_credit(Money(1200)), Money(1080));
        assert_eq!(policy.provider_credit(Money(1005)), Money(904));
    }

    #[test]
    fn test_policy_rejects_out_of_range_share() {
        assert!(FeePolicy::new(dec!(0)).is_err());
        assert!(FeePolicy::new(dec!(1.1)).is_err());
        assert!(FeePolicy::new(dec!(-0.5)).is_err());
        assert!(FeePolicy::new(dec!(1)).is_ok());
    }
}
