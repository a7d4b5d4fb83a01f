//! Minor-unit checks for monetary amounts.

use crate::error::{Result, WalletError};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Largest value a `NUMERIC(20, 4)` ledger column holds: 9999999999999999.9999.
/// Bounds both single amounts and account balances.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(1_661_992_959, 1_808_227_885, 5, false, 4);

/// Reject non-positive amounts, amounts finer than the currency's minor unit
/// and amounts the ledger cannot store.
pub fn validate_amount(amount: Decimal, scale: u32) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(WalletError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }

    if amount > MAX_AMOUNT {
        return Err(WalletError::InvalidAmount(format!(
            "amount {} exceeds the maximum of {}",
            amount, MAX_AMOUNT
        )));
    }

    let normalized = amount.normalize();
    if normalized.scale() > scale {
        return Err(WalletError::InvalidAmount(format!(
            "amount {} has more than {} decimal places",
            amount, scale
        )));
    }

    Ok(amount)
}

/// Amount expressed in minor units (cents, piastres).
pub fn to_minor_units(amount: Decimal, scale: u32) -> Option<i64> {
    let factor = Decimal::from(10i64.checked_pow(scale)?);
    amount.checked_mul(factor)?.round().to_i64()
}

/// Round a balance difference to the minor unit.
pub fn round_to_scale(amount: Decimal, scale: u32) -> Decimal {
    amount.round_dp(scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rejects_zero_and_negative() {
        assert!(matches!(
            validate_amount(Decimal::ZERO, 2),
            Err(WalletError::InvalidAmount(_))
        ));
        assert!(matches!(
            validate_amount(dec!(-5.00), 2),
            Err(WalletError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_rejects_sub_minor_precision() {
        assert!(validate_amount(dec!(0.01), 2).is_ok());
        assert!(validate_amount(dec!(10.500), 2).is_ok()); // trailing zero is fine
        assert!(matches!(
            validate_amount(dec!(0.001), 2),
            Err(WalletError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_rejects_amounts_beyond_column_precision() {
        assert_eq!(MAX_AMOUNT, dec!(9999999999999999.9999));
        assert!(validate_amount(dec!(9999999999999999.99), 2).is_ok());
        assert!(matches!(
            validate_amount(dec!(10000000000000000), 2),
            Err(WalletError::InvalidAmount(_))
        ));
        assert!(matches!(
            validate_amount(dec!(100000000000000000), 2),
            Err(WalletError::InvalidAmount(_))
        ));
        assert!(matches!(
            validate_amount(Decimal::MAX, 2),
            Err(WalletError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(to_minor_units(dec!(100.00), 2), Some(10_000));
        assert_eq!(to_minor_units(dec!(0.01), 2), Some(1));
        assert_eq!(to_minor_units(dec!(12.5), 3), Some(12_500));
    }
}
