use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Reason is required for admin adjustments")]
    MissingReason,

    #[error("Idempotency key is required")]
    MissingIdempotencyKey,

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Insufficient balance for {user_id}: requested {requested}, available {available}")]
    InsufficientBalance {
        user_id: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Original entry not found: {0}")]
    OriginalNotFound(Uuid),

    #[error("Entry {0} is not a debit and cannot be refunded")]
    NotADebit(Uuid),

    #[error("Refund of {requested} exceeds refundable {refundable} for entry {original_id}")]
    RefundExceedsOriginal {
        original_id: Uuid,
        requested: Decimal,
        refundable: Decimal,
    },

    #[error("Entry {original_id} belongs to {owner}, refund requested for {requested_for}")]
    RefundAccountMismatch {
        original_id: Uuid,
        owner: String,
        requested_for: String,
    },

    /// Transient storage contention (deadlock, serialization failure, lock
    /// timeout). Retried inside the engine, never returned to callers as is.
    #[error("Storage conflict: {0}")]
    Conflict(String),

    #[error("Transient failure after {attempts} attempts: {last_error}")]
    TransientFailure { attempts: u32, last_error: String },

    #[error("Storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

pub type Result<T> = std::result::Result<T, WalletError>;

impl WalletError {
    /// Contention worth retrying the whole atomic unit for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::Conflict(_))
    }

    /// Definitive outcomes of evaluating current state or caller input.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            WalletError::InvalidAmount(_)
                | WalletError::MissingReason
                | WalletError::MissingIdempotencyKey
                | WalletError::InvalidQuery(_)
                | WalletError::AccountNotFound(_)
                | WalletError::InsufficientBalance { .. }
                | WalletError::OriginalNotFound(_)
                | WalletError::NotADebit(_)
                | WalletError::RefundExceedsOriginal { .. }
                | WalletError::RefundAccountMismatch { .. }
        )
    }

    /// Whether an end-user facing caller (ride charge, refund screen) may show
    /// this error. Everything else is internal/admin detail.
    pub fn is_user_visible(&self) -> bool {
        self.is_business_rule()
    }

    pub fn code(&self) -> &'static str {
        match self {
            WalletError::InvalidAmount(_) => "INVALID_AMOUNT",
            WalletError::MissingReason => "MISSING_REASON",
            WalletError::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            WalletError::InvalidQuery(_) => "INVALID_QUERY",
            WalletError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            WalletError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            WalletError::OriginalNotFound(_) => "ORIGINAL_NOT_FOUND",
            WalletError::NotADebit(_) => "NOT_A_DEBIT",
            WalletError::RefundExceedsOriginal { .. } => "REFUND_EXCEEDS_ORIGINAL",
            WalletError::RefundAccountMismatch { .. } => "REFUND_ACCOUNT_MISMATCH",
            WalletError::Conflict(_) | WalletError::TransientFailure { .. } => "TRANSIENT_FAILURE",
            WalletError::Storage(_) | WalletError::Migration(_) => "STORAGE_FAILURE",
            _ => "INTERNAL_ERROR",
        }
    }
}

/// Map a sqlx error onto the wallet taxonomy. Deadlocks, serialization
/// failures and lock timeouts become [`WalletError::Conflict`].
pub(crate) fn classify_sqlx(err: sqlx::Error) -> WalletError {
    let transient = match &err {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("40P01") | Some("40001") | Some("55P03")
        ),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    };

    if transient {
        WalletError::Conflict(err.to_string())
    } else {
        WalletError::Storage(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(WalletError::Conflict("deadlock detected".to_string()).is_retryable());
        assert!(!WalletError::InvalidAmount("0".to_string()).is_retryable());
        assert!(!WalletError::TransientFailure {
            attempts: 5,
            last_error: "deadlock".to_string(),
        }
        .is_retryable());
        assert!(!WalletError::InsufficientBalance {
            user_id: "u1".to_string(),
            requested: dec!(100),
            available: dec!(70),
        }
        .is_retryable());
    }

    #[test]
    fn test_business_rule_errors_are_user_visible() {
        let err = WalletError::RefundExceedsOriginal {
            original_id: Uuid::new_v4(),
            requested: dec!(10),
            refundable: dec!(0),
        };
        assert!(err.is_business_rule());
        assert!(err.is_user_visible());
        assert_eq!(err.code(), "REFUND_EXCEEDS_ORIGINAL");

        let transient = WalletError::TransientFailure {
            attempts: 5,
            last_error: "serialization failure".to_string(),
        };
        assert!(!transient.is_user_visible());
        assert_eq!(transient.code(), "TRANSIENT_FAILURE");
    }

    #[test]
    fn test_pool_timeout_is_classified_transient() {
        assert!(classify_sqlx(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!classify_sqlx(sqlx::Error::RowNotFound).is_retryable());
    }
}
