#![allow(dead_code)]

use std::sync::Arc;
use wallet_engine::{
    EntryType, LocalBalanceCache, MemoryLedgerStore, RetryPolicy, WalletEngine, WalletRequest,
};

pub fn engine() -> (Arc<WalletEngine>, Arc<MemoryLedgerStore>) {
    let store = Arc::new(MemoryLedgerStore::new());
    let engine = WalletEngine::new(store.clone(), Arc::new(LocalBalanceCache::new(60)))
        .with_retry_policy(RetryPolicy::immediate(5));
    (Arc::new(engine), store)
}

pub fn top_up(user: &str, amount: rust_decimal::Decimal, key: &str) -> WalletRequest {
    WalletRequest::new(user, amount, EntryType::TopUp, key)
}

pub fn ride_charge(user: &str, amount: rust_decimal::Decimal, key: &str) -> WalletRequest {
    WalletRequest::new(user, amount, EntryType::RideCharge, key)
}
