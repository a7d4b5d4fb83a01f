//! Wallet engine: validates requests, enforces idempotency and drives each
//! movement through the store as one atomic, retried unit.

use crate::cache::BalanceCache;
use crate::config::Config;
use crate::error::{Result, WalletError};
use crate::metrics;
use crate::money;
use crate::reconciliation::{self, AccountReconciliation};
use crate::retry::RetryPolicy;
use crate::store::{HistoryPage, HistoryQuery, LedgerStore, PostOutcome, Posting, WalletStats};
use crate::types::{
    Actor, Direction, EntryType, LedgerEntry, OperationResult, RebuildOutcome, RefundRequest,
    UserId, WalletRequest,
};
use chrono::{NaiveDate, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MINOR_UNIT_SCALE: u32 = 2;

/// Suffix appended to the reason of every bulk credit entry.
pub const BULK_REASON_SUFFIX: &str = " (Bulk operation)";

pub fn default_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

/// Per-user outcome of a bulk credit that did not go through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkFailure {
    pub user_id: UserId,
    pub code: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkCreditReport {
    pub succeeded: Vec<OperationResult>,
    pub failed: Vec<BulkFailure>,
}

pub struct WalletEngine {
    store: Arc<dyn LedgerStore>,
    cache: Arc<dyn BalanceCache>,
    retry: RetryPolicy,
    scale: u32,
    tolerance: Decimal,
}

impl WalletEngine {
    pub fn new(store: Arc<dyn LedgerStore>, cache: Arc<dyn BalanceCache>) -> Self {
        Self {
            store,
            cache,
            retry: RetryPolicy::default(),
            scale: DEFAULT_MINOR_UNIT_SCALE,
            tolerance: default_tolerance(),
        }
    }

    pub fn from_config(
        store: Arc<dyn LedgerStore>,
        cache: Arc<dyn BalanceCache>,
        config: &Config,
    ) -> Result<Self> {
        Ok(Self::new(store, cache)
            .with_retry_policy(config.wallet.retry_policy())
            .with_minor_unit_scale(config.wallet.minor_unit_scale)
            .with_tolerance(config.reconciliation.tolerance()?))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_minor_unit_scale(mut self, scale: u32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_tolerance(mut self, tolerance: Decimal) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Backing store, used by the reconciliation sweep for read-only folds.
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn tolerance(&self) -> Decimal {
        self.tolerance
    }

    /// Decimal places allowed in amounts; discrepancies are rounded to it.
    pub fn minor_unit_scale(&self) -> u32 {
        self.scale
    }

    /// Add `amount` to the user's balance, opening the account if needed.
    pub async fn credit(&self, request: WalletRequest) -> Result<OperationResult> {
        self.execute("credit", Direction::Credit, request, None).await
    }

    /// Take `amount` from an existing account. Fails with
    /// `InsufficientBalance` unless `allow_negative` is set; a rejected debit
    /// writes nothing.
    pub async fn debit(&self, request: WalletRequest) -> Result<OperationResult> {
        self.execute("debit", Direction::Debit, request, None).await
    }

    /// Operator-initiated credit or debit. Each call gets its own key, so two
    /// deliberate clicks are two entries.
    pub async fn admin_adjust(
        &self,
        user_id: &str,
        amount: Decimal,
        direction: Direction,
        admin_id: &str,
        reason: &str,
    ) -> Result<OperationResult> {
        if reason.trim().is_empty() {
            return Err(WalletError::MissingReason);
        }

        let millis = Utc::now().timestamp_millis().to_string();
        let key = Self::generate_idempotency_key("admin_adjust", &[admin_id, user_id, &millis]);
        let entry_type = match direction {
            Direction::Credit => EntryType::AdminCredit,
            Direction::Debit => EntryType::AdminDebit,
        };

        let request = WalletRequest::new(user_id, amount, entry_type, key)
            .actor(Actor::admin(admin_id))
            .reason(reason.trim())
            .origin("admin_console");

        match direction {
            Direction::Credit => self.execute("admin_credit", direction, request, None).await,
            Direction::Debit => self.execute("admin_debit", direction, request, None).await,
        }
    }

    /// Credit back (part of) an earlier debit on the same account.
    pub async fn refund(&self, request: RefundRequest) -> Result<OperationResult> {
        money::validate_amount(request.amount, self.scale)?;

        let key = match &request.idempotency_key {
            Some(key) => key.clone(),
            None => format!(
                "refund:{}:{}:{}",
                request.original_entry_id,
                Utc::now().timestamp_millis(),
                random_suffix()
            ),
        };

        // A replayed refund must not trip the headroom check it already consumed.
        if let Some(existing) = self.store.find_by_idempotency_key(&key).await? {
            return Ok(self.replayed("refund", Direction::Credit, &request.user_id, request.amount, &existing));
        }

        let original = self
            .store
            .find_entry(request.original_entry_id)
            .await?
            .ok_or(WalletError::OriginalNotFound(request.original_entry_id))?;

        if original.user_id != request.user_id {
            return Err(WalletError::RefundAccountMismatch {
                original_id: original.id,
                owner: original.user_id.clone(),
                requested_for: request.user_id.clone(),
            });
        }

        let already_refunded = self.store.refunded_total(original.id).await?;
        crate::projection::ensure_refundable(&original, already_refunded, request.amount)?;

        let actor = match &request.admin_id {
            Some(admin_id) => Actor::admin(admin_id.as_str()),
            None => Actor::System,
        };

        let mut wallet_request =
            WalletRequest::new(&request.user_id, request.amount, EntryType::Refund, key)
                .reference(original.id.to_string())
                .actor(actor)
                .origin("refund");
        if !request.reason.trim().is_empty() {
            wallet_request = wallet_request.reason(request.reason.trim());
        }

        self.execute("refund", Direction::Credit, wallet_request, Some(original))
            .await
    }

    /// Projected balance, zero for a user without an account. The cached value
    /// may lag a concurrent write by up to the cache TTL.
    pub async fn get_balance(&self, user_id: &str, use_cache: bool) -> Result<Decimal> {
        if use_cache {
            if let Some(balance) = self.cache.get(user_id).await {
                return Ok(balance);
            }
        }

        let balance = self
            .store
            .account(user_id)
            .await?
            .map(|account| account.balance)
            .unwrap_or(Decimal::ZERO);

        if use_cache {
            self.cache.put(user_id, balance).await;
        }

        Ok(balance)
    }

    pub async fn reconcile(&self, user_id: &str) -> Result<AccountReconciliation> {
        reconciliation::reconcile_account(self.store.as_ref(), user_id, self.tolerance, self.scale)
            .await
    }

    /// Overwrite the cached balance with the ledger fold. The ledger is left
    /// untouched.
    pub async fn rebuild_balance(&self, user_id: &str, admin_id: &str) -> Result<RebuildOutcome> {
        let started = Instant::now();
        let store = &self.store;

        let result = self
            .retry
            .run("rebuild_balance", move || store.rebuild_balance(user_id))
            .await;

        match result {
            Ok(outcome) => {
                self.cache.invalidate(user_id).await;
                warn!(
                    user_id,
                    actor = admin_id,
                    old_balance = %outcome.old_balance,
                    new_balance = %outcome.new_balance,
                    difference = %outcome.difference,
                    "Wallet balance rebuilt from ledger"
                );
                metrics::record_operation("rebuild_balance", "success", started.elapsed());
                Ok(outcome)
            }
            Err(e) => {
                self.log_failure("rebuild_balance", user_id, "", &e);
                metrics::record_operation("rebuild_balance", e.code(), started.elapsed());
                Err(e)
            }
        }
    }

    /// Credit from a payment provider webhook. The provider's event id is the
    /// idempotency anchor, so webhook replays collapse onto one entry.
    pub async fn top_up_from_webhook(
        &self,
        user_id: &str,
        amount: Decimal,
        payment_id: &str,
        provider: &str,
        provider_event_id: &str,
    ) -> Result<OperationResult> {
        let key = format!("webhook:{}:{}", provider, provider_event_id);
        let request = WalletRequest::new(user_id, amount, EntryType::TopUp, key)
            .reference(payment_id)
            .origin(format!("webhook:{}", provider));

        self.execute("top_up", Direction::Credit, request, None).await
    }

    /// Charge a completed trip's fare, keyed by trip.
    pub async fn charge_for_ride(
        &self,
        customer_id: &str,
        fare: Decimal,
        trip_id: &str,
    ) -> Result<OperationResult> {
        let key = format!("ride_charge:{}", trip_id);
        let request = WalletRequest::new(customer_id, fare, EntryType::RideCharge, key)
            .reference(trip_id)
            .origin("ride_completion");

        self.execute("ride_charge", Direction::Debit, request, None).await
    }

    /// Admin credit to many users. Per-user failures are collected; the batch
    /// never aborts halfway.
    pub async fn bulk_credit(
        &self,
        user_ids: &[UserId],
        amount: Decimal,
        admin_id: &str,
        reason: &str,
    ) -> Result<BulkCreditReport> {
        if reason.trim().is_empty() {
            return Err(WalletError::MissingReason);
        }
        money::validate_amount(amount, self.scale)?;

        let reason = format!("{}{}", reason.trim(), BULK_REASON_SUFFIX);
        let mut report = BulkCreditReport::default();

        for user_id in user_ids {
            match self
                .admin_adjust(user_id, amount, Direction::Credit, admin_id, &reason)
                .await
            {
                Ok(result) => report.succeeded.push(result),
                Err(e) => report.failed.push(BulkFailure {
                    user_id: user_id.clone(),
                    code: e.code().to_string(),
                    error: e.to_string(),
                }),
            }
        }

        info!(
            admin_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Bulk credit finished"
        );

        Ok(report)
    }

    pub async fn history(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        query.validate()?;
        self.store.history(query).await
    }

    pub async fn stats(&self, day: NaiveDate) -> Result<WalletStats> {
        self.store.stats(day).await
    }

    /// `operation:part…:xxxxxxxx` with an 8-character random tail.
    pub fn generate_idempotency_key(operation: &str, parts: &[&str]) -> String {
        let mut key = String::from(operation);
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key.push(':');
        key.push_str(&random_suffix());
        key
    }

    async fn execute(
        &self,
        operation: &'static str,
        direction: Direction,
        request: WalletRequest,
        refund_of: Option<LedgerEntry>,
    ) -> Result<OperationResult> {
        let started = Instant::now();
        let result = self.apply(operation, direction, request, refund_of).await;

        let outcome = match &result {
            Ok(r) if r.duplicate => "duplicate",
            Ok(_) => "success",
            Err(e) => e.code(),
        };
        metrics::record_operation(operation, outcome, started.elapsed());

        result
    }

    async fn apply(
        &self,
        operation: &'static str,
        direction: Direction,
        request: WalletRequest,
        refund_of: Option<LedgerEntry>,
    ) -> Result<OperationResult> {
        let amount = money::validate_amount(request.amount, self.scale)?;

        if request.idempotency_key.trim().is_empty() {
            return Err(WalletError::MissingIdempotencyKey);
        }

        let has_reason = request
            .reason
            .as_deref()
            .map_or(false, |r| !r.trim().is_empty());
        if request.entry_type.requires_reason() && !has_reason {
            return Err(WalletError::MissingReason);
        }

        if let Some(existing) = self
            .store
            .find_by_idempotency_key(&request.idempotency_key)
            .await?
        {
            return Ok(self.replayed(operation, direction, &request.user_id, amount, &existing));
        }

        let posting = self.posting(direction, amount, request, refund_of);
        let store = &self.store;
        let posting_ref = &posting;

        let outcome = self
            .retry
            .run(operation, move || store.post(posting_ref))
            .await;

        match outcome {
            Ok(PostOutcome::Posted {
                entry,
                previous_balance,
            }) => {
                self.cache.invalidate(&entry.user_id).await;
                info!(
                    operation,
                    user_id = %entry.user_id,
                    amount = %amount,
                    entry_id = %entry.id,
                    idempotency_key = %entry.idempotency_key,
                    previous_balance = %previous_balance,
                    new_balance = %entry.balance_after,
                    "Wallet {} applied",
                    direction
                );
                Ok(OperationResult::from_entry(&entry, false))
            }
            Ok(PostOutcome::Duplicate(existing)) => {
                Ok(self.replayed(operation, direction, &posting.user_id, amount, &existing))
            }
            Err(e) => {
                self.log_failure(operation, &posting.user_id, &posting.idempotency_key, &e);
                Err(e)
            }
        }
    }

    fn posting(
        &self,
        direction: Direction,
        amount: Decimal,
        request: WalletRequest,
        refund_of: Option<LedgerEntry>,
    ) -> Posting {
        let mut metadata = Map::new();
        if let Some(minor) = money::to_minor_units(amount, self.scale) {
            metadata.insert("amount_minor".to_string(), json!(minor));
        }
        metadata.insert("direction".to_string(), json!(direction.to_string()));
        metadata.insert("created_by".to_string(), json!(request.actor.to_string()));
        if let Some(origin) = &request.origin {
            metadata.insert("origin".to_string(), json!(origin));
        }

        Posting {
            entry_id: Uuid::new_v4(),
            user_id: request.user_id,
            direction,
            amount,
            entry_type: request.entry_type,
            idempotency_key: request.idempotency_key,
            reference_id: request.reference_id,
            actor: request.actor,
            reason: request.reason,
            metadata,
            allow_negative: direction == Direction::Debit && request.allow_negative,
            create_account: direction == Direction::Credit,
            refund_of,
            created_at: Utc::now(),
        }
    }

    fn replayed(
        &self,
        operation: &str,
        direction: Direction,
        user_id: &str,
        amount: Decimal,
        existing: &LedgerEntry,
    ) -> OperationResult {
        if existing.user_id != user_id
            || existing.amount() != amount
            || existing.direction() != direction
        {
            warn!(
                operation,
                idempotency_key = %existing.idempotency_key,
                entry_id = %existing.id,
                recorded_user = %existing.user_id,
                recorded_amount = %existing.amount(),
                recorded_direction = %existing.direction(),
                requested_user = user_id,
                requested_amount = %amount,
                requested_direction = %direction,
                "Idempotency key replayed with different arguments"
            );
        } else {
            info!(
                operation,
                user_id,
                idempotency_key = %existing.idempotency_key,
                entry_id = %existing.id,
                balance_after = %existing.balance_after,
                "Duplicate wallet operation, returning recorded result"
            );
        }

        OperationResult::from_entry(existing, true)
    }

    fn log_failure(&self, operation: &str, user_id: &str, idempotency_key: &str, e: &WalletError) {
        match e {
            WalletError::InsufficientBalance {
                requested,
                available,
                ..
            } => warn!(
                operation,
                user_id,
                idempotency_key,
                requested = %requested,
                available = %available,
                "Debit rejected: insufficient balance"
            ),
            e if e.is_business_rule() => info!(
                operation,
                user_id,
                idempotency_key,
                code = e.code(),
                "Wallet operation rejected: {}",
                e
            ),
            e => error!(
                operation,
                user_id,
                idempotency_key,
                code = e.code(),
                "Wallet operation failed: {}",
                e
            ),
        }
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}
