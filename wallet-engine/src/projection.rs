//! Account projection rules.
//!
//! The cached `balance` on an account is a fold over its ledger entries:
//! `Σ credit_amount − Σ debit_amount`. Every store applies [`next_balance`]
//! while holding the account lock, so the rule that gates a debit is the same
//! whichever backend persists it.

use crate::error::{Result, WalletError};
use crate::money;
use crate::types::{Direction, LedgerEntry};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balance after applying one movement to `current`.
pub fn next_balance(
    user_id: &str,
    current: Decimal,
    direction: Direction,
    amount: Decimal,
    allow_negative: bool,
) -> Result<Decimal> {
    let next = match direction {
        Direction::Credit => current.checked_add(amount),
        Direction::Debit => {
            if !allow_negative && current < amount {
                return Err(WalletError::InsufficientBalance {
                    user_id: user_id.to_string(),
                    requested: amount,
                    available: current,
                });
            }
            current.checked_sub(amount)
        }
    };

    match next {
        Some(balance) if balance.abs() <= money::MAX_AMOUNT => Ok(balance),
        _ => Err(WalletError::InvalidAmount(format!(
            "{} of {} would take the balance of {} beyond {}",
            direction,
            amount,
            user_id,
            money::MAX_AMOUNT
        ))),
    }
}

/// Aggregated sides of an account's ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub credits: Decimal,
    pub debits: Decimal,
    pub entries: i64,
}

impl LedgerTotals {
    pub fn balance(&self) -> Decimal {
        self.credits.saturating_sub(self.debits)
    }

    pub fn add(&mut self, entry: &LedgerEntry) {
        self.credits = self.credits.saturating_add(entry.credit_amount);
        self.debits = self.debits.saturating_add(entry.debit_amount);
        self.entries += 1;
    }
}

/// Reference fold over a set of entries.
pub fn fold<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> LedgerTotals {
    let mut totals = LedgerTotals::default();
    for entry in entries {
        totals.add(entry);
    }
    totals
}

/// Headroom check for a refund against its original debit.
pub fn ensure_refundable(
    original: &LedgerEntry,
    already_refunded: Decimal,
    requested: Decimal,
) -> Result<()> {
    if !original.is_debit() {
        return Err(WalletError::NotADebit(original.id));
    }

    let refundable = original.debit_amount - already_refunded;
    if requested > refundable {
        return Err(WalletError::RefundExceedsOriginal {
            original_id: original.id,
            requested,
            refundable: refundable.max(Decimal::ZERO),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Actor, EntryType};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn entry(credit: Decimal, debit: Decimal) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            entry_type: if debit > Decimal::ZERO {
                EntryType::RideCharge
            } else {
                EntryType::TopUp
            },
            credit_amount: credit,
            debit_amount: debit,
            balance_after: Decimal::ZERO,
            idempotency_key: Uuid::new_v4().to_string(),
            reference_id: None,
            actor: Actor::System,
            reason: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_debit_of_exact_balance_leaves_zero() {
        let balance = next_balance("u1", dec!(70.00), Direction::Debit, dec!(70.00), false).unwrap();
        assert_eq!(balance, Decimal::ZERO);
    }

    #[test]
    fn test_debit_one_minor_unit_over_is_rejected() {
        let err = next_balance("u1", dec!(70.00), Direction::Debit, dec!(70.01), false).unwrap_err();
        match err {
            WalletError::InsufficientBalance { requested, available, .. } => {
                assert_eq!(requested, dec!(70.01));
                assert_eq!(available, dec!(70.00));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_allow_negative_bypasses_balance_check() {
        let balance = next_balance("u1", dec!(10.00), Direction::Debit, dec!(25.00), true).unwrap();
        assert_eq!(balance, dec!(-15.00));
    }

    #[test]
    fn test_balance_cannot_leave_column_range() {
        let err = next_balance("u1", money::MAX_AMOUNT, Direction::Credit, dec!(0.01), false)
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));

        let err = next_balance("u1", Decimal::MAX, Direction::Credit, Decimal::ONE, false)
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));

        let err = next_balance("u1", Decimal::MIN, Direction::Debit, Decimal::ONE, true)
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));

        let balance =
            next_balance("u1", dec!(9999999999999999.98), Direction::Credit, dec!(0.01), false)
                .unwrap();
        assert_eq!(balance, dec!(9999999999999999.99));
    }

    #[test]
    fn test_fold_sums_both_sides() {
        let entries = vec![
            entry(dec!(100.00), Decimal::ZERO),
            entry(Decimal::ZERO, dec!(30.00)),
            entry(dec!(30.00), Decimal::ZERO),
        ];
        let totals = fold(&entries);
        assert_eq!(totals.credits, dec!(130.00));
        assert_eq!(totals.debits, dec!(30.00));
        assert_eq!(totals.entries, 3);
        assert_eq!(totals.balance(), dec!(100.00));
    }

    #[test]
    fn test_refund_headroom() {
        let original = entry(Decimal::ZERO, dec!(30.00));
        assert!(ensure_refundable(&original, dec!(10.00), dec!(20.00)).is_ok());
        assert!(matches!(
            ensure_refundable(&original, dec!(10.00), dec!(20.01)),
            Err(WalletError::RefundExceedsOriginal { .. })
        ));

        let credit = entry(dec!(50.00), Decimal::ZERO);
        assert!(matches!(
            ensure_refundable(&credit, Decimal::ZERO, dec!(1.00)),
            Err(WalletError::NotADebit(_))
        ));
    }
}
