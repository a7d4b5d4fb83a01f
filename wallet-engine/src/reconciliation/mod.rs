//! Balance reconciliation: compare each account's projection against a fresh
//! fold over its ledger.

pub mod job;
pub mod scheduler;

pub use job::{Discrepancy, ReconciliationJob, ReconciliationReport, ReconciliationScope};
pub use scheduler::ReconciliationScheduler;

use crate::error::{Result, WalletError};
use crate::money;
use crate::store::LedgerStore;
use crate::types::UserId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountReconciliation {
    pub user_id: UserId,
    pub cached_balance: Decimal,
    pub ledger_balance: Decimal,
    /// `cached − ledger`, rounded to the minor unit.
    pub discrepancy: Decimal,
    pub is_valid: bool,
    pub total_credits: Decimal,
    pub total_debits: Decimal,
    pub entry_count: i64,
    pub checked_at: DateTime<Utc>,
}

/// Read-only check of one account. Takes no account lock, so a write landing
/// between the two reads can show up as a transient mismatch.
pub async fn reconcile_account(
    store: &dyn LedgerStore,
    user_id: &str,
    tolerance: Decimal,
    scale: u32,
) -> Result<AccountReconciliation> {
    let account = store
        .account(user_id)
        .await?
        .ok_or_else(|| WalletError::AccountNotFound(user_id.to_string()))?;
    let totals = store.ledger_totals(user_id).await?;

    let ledger_balance = totals.balance();
    let discrepancy = money::round_to_scale(account.balance - ledger_balance, scale);
    let is_valid = discrepancy.is_zero() || discrepancy.abs() < tolerance;

    Ok(AccountReconciliation {
        user_id: user_id.to_string(),
        cached_balance: account.balance,
        ledger_balance,
        discrepancy,
        is_valid,
        total_credits: totals.credits,
        total_debits: totals.debits,
        entry_count: totals.entries,
        checked_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryLedgerStore, PostOutcome, Posting};
    use crate::types::{Actor, Direction, EntryType};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn seed(store: &MemoryLedgerStore, user: &str, amount: Decimal) {
        let posting = Posting {
            entry_id: Uuid::new_v4(),
            user_id: user.to_string(),
            direction: Direction::Credit,
            amount,
            entry_type: EntryType::TopUp,
            idempotency_key: Uuid::new_v4().to_string(),
            reference_id: None,
            actor: Actor::System,
            reason: None,
            metadata: serde_json::Map::new(),
            allow_negative: false,
            create_account: true,
            refund_of: None,
            created_at: Utc::now(),
        };
        assert!(matches!(
            store.post(&posting).await.unwrap(),
            PostOutcome::Posted { .. }
        ));
    }

    #[tokio::test]
    async fn test_consistent_account_is_valid() {
        let store = MemoryLedgerStore::new();
        seed(&store, "u1", dec!(100.00)).await;

        let result = reconcile_account(&store, "u1", dec!(0.01), 2).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(result.discrepancy, Decimal::ZERO);
        assert_eq!(result.entry_count, 1);
    }

    #[tokio::test]
    async fn test_drift_outside_tolerance_is_reported() {
        let store = MemoryLedgerStore::new();
        seed(&store, "u1", dec!(100.00)).await;
        store.overwrite_projection("u1", dec!(105.00)).await;

        let result = reconcile_account(&store, "u1", dec!(0.01), 2).await.unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.cached_balance, dec!(105.00));
        assert_eq!(result.ledger_balance, dec!(100.00));
        assert_eq!(result.discrepancy, dec!(5.00));
    }

    #[tokio::test]
    async fn test_zero_tolerance_accepts_exact_match() {
        let store = MemoryLedgerStore::new();
        seed(&store, "u1", dec!(12.34)).await;

        let result = reconcile_account(&store, "u1", Decimal::ZERO, 2).await.unwrap();
        assert!(result.is_valid);
    }

    #[tokio::test]
    async fn test_missing_account() {
        let store = MemoryLedgerStore::new();
        let err = reconcile_account(&store, "nobody", dec!(0.01), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::AccountNotFound(_)));
    }
}
