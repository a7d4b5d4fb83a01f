//! Persistence seam for the transaction ledger and the account projection.

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use crate::error::{Result, WalletError};
use crate::projection::LedgerTotals;
use crate::types::{
    Account, Actor, Direction, EntryId, EntryType, LedgerEntry, RebuildOutcome, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A fully validated movement, ready to be applied atomically.
#[derive(Debug, Clone)]
pub struct Posting {
    pub entry_id: EntryId,
    pub user_id: UserId,
    pub direction: Direction,
    pub amount: Decimal,
    pub entry_type: EntryType,
    pub idempotency_key: String,
    pub reference_id: Option<String>,
    pub actor: Actor,
    pub reason: Option<String>,
    /// Audit context; the store adds `previous_balance`.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub allow_negative: bool,
    /// Credits may open the account; debits require it to exist.
    pub create_account: bool,
    /// Re-checked under the account lock when the posting is a refund.
    pub refund_of: Option<LedgerEntry>,
    pub created_at: DateTime<Utc>,
}

impl Posting {
    pub(crate) fn credit_amount(&self) -> Decimal {
        match self.direction {
            Direction::Credit => self.amount,
            Direction::Debit => Decimal::ZERO,
        }
    }

    pub(crate) fn debit_amount(&self) -> Decimal {
        match self.direction {
            Direction::Credit => Decimal::ZERO,
            Direction::Debit => self.amount,
        }
    }

    pub(crate) fn metadata_with_previous(&self, previous_balance: Decimal) -> serde_json::Value {
        let mut metadata = self.metadata.clone();
        metadata.insert(
            "previous_balance".to_string(),
            serde_json::Value::String(previous_balance.to_string()),
        );
        serde_json::Value::Object(metadata)
    }
}

/// Result of [`LedgerStore::post`].
#[derive(Debug, Clone)]
pub enum PostOutcome {
    Posted {
        entry: LedgerEntry,
        previous_balance: Decimal,
    },
    /// The idempotency key was already taken; nothing was written.
    Duplicate(LedgerEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryFilter {
    #[default]
    All,
    Credit,
    Debit,
}

pub const DEFAULT_HISTORY_LIMIT: i64 = 20;
pub const MAX_HISTORY_LIMIT: i64 = 100;

/// Paged listing of one account's ledger, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub user_id: UserId,
    pub filter: EntryFilter,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    /// 1-based.
    pub page: i64,
}

impl HistoryQuery {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            filter: EntryFilter::All,
            from: None,
            to: None,
            limit: DEFAULT_HISTORY_LIMIT,
            page: 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_HISTORY_LIMIT).contains(&self.limit) {
            return Err(WalletError::InvalidQuery(format!(
                "limit must be between 1 and {}",
                MAX_HISTORY_LIMIT
            )));
        }
        if self.page < 1 {
            return Err(WalletError::InvalidQuery("page starts at 1".to_string()));
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if to < from {
                return Err(WalletError::InvalidQuery(
                    "end date is before start date".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }

    pub(crate) fn matches(&self, entry: &LedgerEntry) -> bool {
        let side = match self.filter {
            EntryFilter::All => true,
            EntryFilter::Credit => entry.credit_amount > Decimal::ZERO,
            EntryFilter::Debit => entry.debit_amount > Decimal::ZERO,
        };
        side && entry.user_id == self.user_id
            && self.from.map_or(true, |from| entry.created_at >= from)
            && self.to.map_or(true, |to| entry.created_at <= to)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub entries: Vec<LedgerEntry>,
    pub total: i64,
    pub limit: i64,
    pub page: i64,
}

/// Dashboard figures for one UTC day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletStats {
    pub day: Option<NaiveDate>,
    pub accounts: i64,
    pub total_balance: Decimal,
    pub day_credits: Decimal,
    pub day_debits: Decimal,
    pub day_net: Decimal,
    pub day_top_ups: i64,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<LedgerEntry>>;

    async fn find_entry(&self, id: EntryId) -> Result<Option<LedgerEntry>>;

    /// Σ credit_amount of refund entries referencing `original_id`.
    async fn refunded_total(&self, original_id: EntryId) -> Result<Decimal>;

    /// Apply one posting: lock the account, update its balance and append the
    /// ledger entry, all or nothing.
    async fn post(&self, posting: &Posting) -> Result<PostOutcome>;

    /// Lock the account, fold its ledger and overwrite the cached balance.
    async fn rebuild_balance(&self, user_id: &str) -> Result<RebuildOutcome>;

    async fn account(&self, user_id: &str) -> Result<Option<Account>>;

    async fn ledger_totals(&self, user_id: &str) -> Result<LedgerTotals>;

    async fn account_ids(&self) -> Result<Vec<UserId>>;

    async fn history(&self, query: &HistoryQuery) -> Result<HistoryPage>;

    async fn stats(&self, day: NaiveDate) -> Result<WalletStats>;
}

pub(crate) fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or_else(Utc::now);
    (start, start + chrono::Duration::days(1))
}
