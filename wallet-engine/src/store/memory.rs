//! In-process ledger store.
//!
//! Same contract as the Postgres store: one async mutex per account stands in
//! for `SELECT … FOR UPDATE`, and the key index of the append-only log stands
//! in for the unique constraint on `idempotency_key`.

use super::{day_bounds, HistoryPage, HistoryQuery, LedgerStore, PostOutcome, Posting, WalletStats};
use crate::error::{Result, WalletError};
use crate::projection::{self, LedgerTotals};
use crate::types::{Account, EntryId, EntryType, LedgerEntry, RebuildOutcome, UserId};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug)]
struct AccountSlot {
    balance: Decimal,
    /// False until the first committed posting; a slot created for a
    /// rejected posting stays invisible.
    exists: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AccountSlot {
    fn empty() -> Self {
        let now = Utc::now();
        Self {
            balance: Decimal::ZERO,
            exists: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    entries: Vec<LedgerEntry>,
    by_id: HashMap<EntryId, usize>,
    by_key: HashMap<String, usize>,
}

impl Ledger {
    fn get_by_key(&self, key: &str) -> Option<&LedgerEntry> {
        self.by_key.get(key).map(|&i| &self.entries[i])
    }

    fn append(&mut self, entry: LedgerEntry) {
        let index = self.entries.len();
        self.by_id.insert(entry.id, index);
        self.by_key.insert(entry.idempotency_key.clone(), index);
        self.entries.push(entry);
    }

    fn totals_for(&self, user_id: &str) -> LedgerTotals {
        projection::fold(self.entries.iter().filter(|e| e.user_id == user_id))
    }

    fn refunded_total(&self, original_id: EntryId) -> Decimal {
        let reference = original_id.to_string();
        self.entries
            .iter()
            .filter(|e| e.entry_type == EntryType::Refund)
            .filter(|e| e.reference_id.as_deref() == Some(reference.as_str()))
            .map(|e| e.credit_amount)
            .sum()
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    accounts: DashMap<UserId, Arc<Mutex<AccountSlot>>>,
    ledger: RwLock<Ledger>,
    injected_conflicts: AtomicU32,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` postings fail with a transient conflict, the way
    /// a deadlock victim would.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Overwrite an account's cached balance without a ledger entry, as an
    /// out-of-band writer would. Creates the account if needed.
    pub async fn overwrite_projection(&self, user_id: &str, balance: Decimal) {
        let slot = self.slot_or_create(user_id);
        let mut account = slot.lock().await;
        account.balance = balance;
        account.exists = true;
        account.updated_at = Utc::now();
    }

    pub fn entry_count(&self) -> usize {
        self.ledger.read().entries.len()
    }

    fn slot(&self, user_id: &str) -> Option<Arc<Mutex<AccountSlot>>> {
        self.accounts.get(user_id).map(|slot| slot.value().clone())
    }

    fn slot_or_create(&self, user_id: &str) -> Arc<Mutex<AccountSlot>> {
        self.accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AccountSlot::empty())))
            .value()
            .clone()
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.ledger.read().get_by_key(key).cloned())
    }

    async fn find_entry(&self, id: EntryId) -> Result<Option<LedgerEntry>> {
        let ledger = self.ledger.read();
        Ok(ledger.by_id.get(&id).map(|&i| ledger.entries[i].clone()))
    }

    async fn refunded_total(&self, original_id: EntryId) -> Result<Decimal> {
        Ok(self.ledger.read().refunded_total(original_id))
    }

    async fn post(&self, posting: &Posting) -> Result<PostOutcome> {
        if self.take_injected_conflict() {
            return Err(WalletError::Conflict("deadlock detected (injected)".to_string()));
        }

        let slot = if posting.create_account {
            self.slot_or_create(&posting.user_id)
        } else {
            self.slot(&posting.user_id)
                .ok_or_else(|| WalletError::AccountNotFound(posting.user_id.clone()))?
        };
        let mut account = slot.lock().await;

        if !account.exists && !posting.create_account {
            return Err(WalletError::AccountNotFound(posting.user_id.clone()));
        }

        let previous_balance = account.balance;

        let mut ledger = self.ledger.write();

        if let Some(existing) = ledger.get_by_key(&posting.idempotency_key) {
            return Ok(PostOutcome::Duplicate(existing.clone()));
        }

        if let Some(original) = &posting.refund_of {
            let already = ledger.refunded_total(original.id);
            projection::ensure_refundable(original, already, posting.amount)?;
        }

        let new_balance = projection::next_balance(
            &posting.user_id,
            previous_balance,
            posting.direction,
            posting.amount,
            posting.allow_negative,
        )?;

        let entry = LedgerEntry {
            id: posting.entry_id,
            user_id: posting.user_id.clone(),
            entry_type: posting.entry_type,
            credit_amount: posting.credit_amount(),
            debit_amount: posting.debit_amount(),
            balance_after: new_balance,
            idempotency_key: posting.idempotency_key.clone(),
            reference_id: posting.reference_id.clone(),
            actor: posting.actor.clone(),
            reason: posting.reason.clone(),
            metadata: posting.metadata_with_previous(previous_balance),
            created_at: posting.created_at,
        };

        ledger.append(entry.clone());
        drop(ledger);

        account.balance = new_balance;
        account.exists = true;
        account.updated_at = posting.created_at;

        Ok(PostOutcome::Posted {
            entry,
            previous_balance,
        })
    }

    async fn rebuild_balance(&self, user_id: &str) -> Result<RebuildOutcome> {
        let slot = self
            .slot(user_id)
            .ok_or_else(|| WalletError::AccountNotFound(user_id.to_string()))?;
        let mut account = slot.lock().await;
        if !account.exists {
            return Err(WalletError::AccountNotFound(user_id.to_string()));
        }

        let old_balance = account.balance;
        let new_balance = self.ledger.read().totals_for(user_id).balance();

        account.balance = new_balance;
        account.updated_at = Utc::now();

        Ok(RebuildOutcome {
            user_id: user_id.to_string(),
            old_balance,
            new_balance,
            difference: new_balance - old_balance,
        })
    }

    async fn account(&self, user_id: &str) -> Result<Option<Account>> {
        let Some(slot) = self.slot(user_id) else {
            return Ok(None);
        };
        let account = slot.lock().await;
        if !account.exists {
            return Ok(None);
        }
        Ok(Some(Account {
            user_id: user_id.to_string(),
            balance: account.balance,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }))
    }

    async fn ledger_totals(&self, user_id: &str) -> Result<LedgerTotals> {
        Ok(self.ledger.read().totals_for(user_id))
    }

    async fn account_ids(&self) -> Result<Vec<UserId>> {
        let slots: Vec<(UserId, Arc<Mutex<AccountSlot>>)> = self
            .accounts
            .iter()
            .map(|slot| (slot.key().clone(), slot.value().clone()))
            .collect();

        let mut ids = Vec::with_capacity(slots.len());
        for (user_id, slot) in slots {
            if slot.lock().await.exists {
                ids.push(user_id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn history(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        query.validate()?;

        let ledger = self.ledger.read();
        let mut matching: Vec<&LedgerEntry> =
            ledger.entries.iter().filter(|e| query.matches(e)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as i64;
        let entries = matching
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit as usize)
            .cloned()
            .collect();

        Ok(HistoryPage {
            entries,
            total,
            limit: query.limit,
            page: query.page,
        })
    }

    async fn stats(&self, day: NaiveDate) -> Result<WalletStats> {
        let mut stats = WalletStats {
            day: Some(day),
            ..WalletStats::default()
        };

        let slots: Vec<Arc<Mutex<AccountSlot>>> =
            self.accounts.iter().map(|slot| slot.value().clone()).collect();
        for slot in slots {
            let account = slot.lock().await;
            if account.exists {
                stats.accounts += 1;
                stats.total_balance += account.balance;
            }
        }

        let (start, end) = day_bounds(day);
        let ledger = self.ledger.read();
        for entry in ledger
            .entries
            .iter()
            .filter(|e| e.created_at >= start && e.created_at < end)
        {
            stats.day_credits += entry.credit_amount;
            stats.day_debits += entry.debit_amount;
            if entry.entry_type == EntryType::TopUp {
                stats.day_top_ups += 1;
            }
        }
        stats.day_net = stats.day_credits - stats.day_debits;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Actor, Direction};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn posting(user: &str, direction: Direction, amount: Decimal, key: &str) -> Posting {
        Posting {
            entry_id: Uuid::new_v4(),
            user_id: user.to_string(),
            direction,
            amount,
            entry_type: match direction {
                Direction::Credit => EntryType::TopUp,
                Direction::Debit => EntryType::RideCharge,
            },
            idempotency_key: key.to_string(),
            reference_id: None,
            actor: Actor::System,
            reason: None,
            metadata: serde_json::Map::new(),
            allow_negative: false,
            create_account: direction == Direction::Credit,
            refund_of: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_credit_creates_account() {
        let store = MemoryLedgerStore::new();
        let outcome = store
            .post(&posting("u1", Direction::Credit, dec!(100.00), "k1"))
            .await
            .unwrap();

        match outcome {
            PostOutcome::Posted { entry, previous_balance } => {
                assert_eq!(previous_balance, Decimal::ZERO);
                assert_eq!(entry.balance_after, dec!(100.00));
                assert_eq!(entry.previous_balance(), Some(Decimal::ZERO));
            }
            PostOutcome::Duplicate(_) => panic!("first posting reported as duplicate"),
        }
        assert_eq!(store.account("u1").await.unwrap().unwrap().balance, dec!(100.00));
    }

    #[tokio::test]
    async fn test_debit_on_missing_account_leaves_no_trace() {
        let store = MemoryLedgerStore::new();
        let err = store
            .post(&posting("ghost", Direction::Debit, dec!(1.00), "k1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::AccountNotFound(_)));
        assert!(store.account("ghost").await.unwrap().is_none());
        assert!(store.account_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_credit_does_not_surface_account() {
        let store = MemoryLedgerStore::new();
        store.post(&posting("u1", Direction::Credit, dec!(5.00), "shared")).await.unwrap();

        // Key already used by u1: u2's slot is created under lock but never committed.
        let outcome = store
            .post(&posting("u2", Direction::Credit, dec!(5.00), "shared"))
            .await
            .unwrap();
        assert!(matches!(outcome, PostOutcome::Duplicate(_)));
        assert!(store.account("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let store = MemoryLedgerStore::new();
        store.inject_conflicts(2);
        let p = posting("u1", Direction::Credit, dec!(1.00), "k1");

        assert!(store.post(&p).await.unwrap_err().is_retryable());
        assert!(store.post(&p).await.unwrap_err().is_retryable());
        assert!(store.post(&p).await.is_ok());
        assert_eq!(store.entry_count(), 1);
    }
}
