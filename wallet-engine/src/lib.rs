//! Rateel Wallet Engine
//!
//! Per-user balances kept as a projection of an immutable, append-only
//! transaction ledger.
//!
//! # Invariants
//!
//! - Projection: `account.balance == Σ credit_amount − Σ debit_amount`
//! - One side: no entry has both a credit and a debit amount
//! - Idempotency: one ledger entry per idempotency key, enforced by the store
//! - Non-negative: balances stay ≥ 0 unless a debit explicitly allows otherwise

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod money;
pub mod projection;
pub mod reconciliation;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod types;

// Re-exports
pub use cache::{BalanceCache, LocalBalanceCache, RedisBalanceCache};
pub use config::Config;
pub use engine::{BulkCreditReport, WalletEngine};
pub use error::{Result, WalletError};
pub use reconciliation::{
    AccountReconciliation, ReconciliationJob, ReconciliationReport, ReconciliationScheduler,
    ReconciliationScope,
};
pub use retry::RetryPolicy;
pub use store::{
    EntryFilter, HistoryPage, HistoryQuery, LedgerStore, MemoryLedgerStore, PgLedgerStore,
    WalletStats,
};
pub use types::{
    Account, Actor, Direction, EntryId, EntryType, LedgerEntry, OperationResult, RebuildOutcome,
    RefundRequest, UserId, WalletRequest,
};
