//! Core wallet types: accounts, ledger entries and operation requests.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Owning identity of a wallet account.
pub type UserId = String;

/// Ledger entry identifier.
pub type EntryId = Uuid;

/// Kind of monetary event recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
pub enum EntryType {
    TopUp,
    RideCharge,
    Refund,
    AdminCredit,
    AdminDebit,
    LoyaltyConversion,
    ReferralEarning,
    LevelReward,
    PromotionalCredit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::TopUp => "top_up",
            EntryType::RideCharge => "ride_charge",
            EntryType::Refund => "refund",
            EntryType::AdminCredit => "admin_credit",
            EntryType::AdminDebit => "admin_debit",
            EntryType::LoyaltyConversion => "loyalty_conversion",
            EntryType::ReferralEarning => "referral_earning",
            EntryType::LevelReward => "level_reward",
            EntryType::PromotionalCredit => "promotional_credit",
        }
    }

    /// Admin-initiated entries must carry a reason.
    pub fn requires_reason(&self) -> bool {
        matches!(self, EntryType::AdminCredit | EntryType::AdminDebit)
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "top_up" => Ok(EntryType::TopUp),
            "ride_charge" => Ok(EntryType::RideCharge),
            "refund" => Ok(EntryType::Refund),
            "admin_credit" => Ok(EntryType::AdminCredit),
            "admin_debit" => Ok(EntryType::AdminDebit),
            "loyalty_conversion" => Ok(EntryType::LoyaltyConversion),
            "referral_earning" => Ok(EntryType::ReferralEarning),
            "level_reward" => Ok(EntryType::LevelReward),
            "promotional_credit" => Ok(EntryType::PromotionalCredit),
            other => Err(format!("unknown entry type: {}", other)),
        }
    }
}

/// Side of the ledger an entry lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Credit => write!(f, "credit"),
            Direction::Debit => write!(f, "debit"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "credit" => Ok(Direction::Credit),
            "debit" => Ok(Direction::Debit),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// Who initiated a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Actor {
    System,
    Admin(String),
}

impl Actor {
    pub fn admin(id: impl Into<String>) -> Self {
        Actor::Admin(id.into())
    }
}

impl Default for Actor {
    fn default() -> Self {
        Actor::System
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => write!(f, "system"),
            Actor::Admin(id) => write!(f, "admin:{}", id),
        }
    }
}

impl From<String> for Actor {
    fn from(value: String) -> Self {
        match value.strip_prefix("admin:") {
            Some(id) => Actor::Admin(id.to_string()),
            None if value == "system" => Actor::System,
            None => Actor::Admin(value),
        }
    }
}

impl From<Actor> for String {
    fn from(actor: Actor) -> Self {
        actor.to_string()
    }
}

/// Cached balance projection, one row per user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub user_id: UserId,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable monetary event. Exactly one of `credit_amount` and
/// `debit_amount` is non-zero.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user_id: UserId,
    pub entry_type: EntryType,
    pub credit_amount: Decimal,
    pub debit_amount: Decimal,
    /// Audit snapshot, not authoritative.
    pub balance_after: Decimal,
    pub idempotency_key: String,
    pub reference_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub actor: Actor,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn direction(&self) -> Direction {
        if self.debit_amount > Decimal::ZERO {
            Direction::Debit
        } else {
            Direction::Credit
        }
    }

    pub fn is_debit(&self) -> bool {
        self.direction() == Direction::Debit
    }

    pub fn amount(&self) -> Decimal {
        match self.direction() {
            Direction::Credit => self.credit_amount,
            Direction::Debit => self.debit_amount,
        }
    }

    /// Balance before this entry, as recorded in the audit metadata.
    pub fn previous_balance(&self) -> Option<Decimal> {
        self.metadata
            .get("previous_balance")
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
    }
}

/// Input to Credit and Debit.
#[derive(Debug, Clone)]
pub struct WalletRequest {
    pub user_id: UserId,
    pub amount: Decimal,
    pub entry_type: EntryType,
    pub idempotency_key: String,
    pub reference_id: Option<String>,
    pub actor: Actor,
    pub reason: Option<String>,
    /// Where the request came from (webhook provider, admin console, job).
    pub origin: Option<String>,
    /// Debit only.
    pub allow_negative: bool,
}

impl WalletRequest {
    pub fn new(
        user_id: impl Into<UserId>,
        amount: Decimal,
        entry_type: EntryType,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            amount,
            entry_type,
            idempotency_key: idempotency_key.into(),
            reference_id: None,
            actor: Actor::System,
            reason: None,
            origin: None,
            allow_negative: false,
        }
    }

    pub fn reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn allow_negative(mut self, allow: bool) -> Self {
        self.allow_negative = allow;
        self
    }
}

/// Input to Refund.
#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub user_id: UserId,
    pub amount: Decimal,
    pub original_entry_id: EntryId,
    pub reason: String,
    pub admin_id: Option<String>,
    /// Caller-supplied key; generated when absent.
    pub idempotency_key: Option<String>,
}

impl RefundRequest {
    pub fn new(
        user_id: impl Into<UserId>,
        amount: Decimal,
        original_entry_id: EntryId,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            amount,
            original_entry_id,
            reason: reason.into(),
            admin_id: None,
            idempotency_key: None,
        }
    }

    pub fn admin(mut self, admin_id: impl Into<String>) -> Self {
        self.admin_id = Some(admin_id.into());
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Outcome of an accepted (or replayed) wallet operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub entry_id: EntryId,
    pub user_id: UserId,
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub previous_balance: Option<Decimal>,
    /// True when the idempotency key had already been applied.
    pub duplicate: bool,
}

impl OperationResult {
    pub(crate) fn from_entry(entry: &LedgerEntry, duplicate: bool) -> Self {
        Self {
            entry_id: entry.id,
            user_id: entry.user_id.clone(),
            entry_type: entry.entry_type,
            amount: entry.amount(),
            balance_after: entry.balance_after,
            previous_balance: entry.previous_balance(),
            duplicate,
        }
    }
}

/// Before/after values of an admin-invoked balance repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildOutcome {
    pub user_id: UserId,
    pub old_balance: Decimal,
    pub new_balance: Decimal,
    pub difference: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_entry_type_round_trips_through_str() {
        for t in [
            EntryType::TopUp,
            EntryType::RideCharge,
            EntryType::Refund,
            EntryType::AdminCredit,
            EntryType::AdminDebit,
            EntryType::LoyaltyConversion,
            EntryType::ReferralEarning,
            EntryType::LevelReward,
            EntryType::PromotionalCredit,
        ] {
            assert_eq!(t.as_str().parse::<EntryType>().unwrap(), t);
        }
        assert!("wallet_payment".parse::<EntryType>().is_err());
    }

    #[test]
    fn test_actor_string_form() {
        assert_eq!(Actor::System.to_string(), "system");
        assert_eq!(Actor::admin("42").to_string(), "admin:42");
        assert_eq!(Actor::from("admin:42".to_string()), Actor::admin("42"));
        assert_eq!(Actor::from("system".to_string()), Actor::System);
    }

    #[test]
    fn test_direction_parse_is_case_insensitive() {
        assert_eq!("Credit".parse::<Direction>().unwrap(), Direction::Credit);
        assert_eq!("debit".parse::<Direction>().unwrap(), Direction::Debit);
        assert!("transfer".parse::<Direction>().is_err());
    }

    #[test]
    fn test_entry_direction_and_previous_balance() {
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            entry_type: EntryType::RideCharge,
            credit_amount: Decimal::ZERO,
            debit_amount: dec!(30.00),
            balance_after: dec!(70.00),
            idempotency_key: "k2".to_string(),
            reference_id: Some("trip-5".to_string()),
            actor: Actor::System,
            reason: None,
            metadata: serde_json::json!({ "previous_balance": "100.00" }),
            created_at: Utc::now(),
        };
        assert!(entry.is_debit());
        assert_eq!(entry.amount(), dec!(30.00));
        assert_eq!(entry.previous_balance(), Some(dec!(100.00)));
    }
}
