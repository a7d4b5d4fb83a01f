use super::{day_bounds, HistoryPage, HistoryQuery, LedgerStore, PostOutcome, Posting, WalletStats};
use crate::error::{classify_sqlx, Result, WalletError};
use crate::projection::{self, LedgerTotals};
use crate::store::EntryFilter;
use crate::types::{Account, EntryId, LedgerEntry, RebuildOutcome, UserId};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::PgConnection;
use tracing::{debug, error};

/// Ledger store backed by Postgres. Every write runs in one transaction that
/// holds the account row lock until commit.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_balance(conn: &mut PgConnection, user_id: &str) -> Result<Option<Decimal>> {
        sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT balance FROM wallet_accounts WHERE user_id = $1 FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(classify_sqlx)
    }

    /// Lock the account row, creating it at zero first when allowed.
    async fn lock_or_open(conn: &mut PgConnection, posting: &Posting) -> Result<Decimal> {
        if let Some(balance) = Self::lock_balance(&mut *conn, &posting.user_id).await? {
            return Ok(balance);
        }

        if !posting.create_account {
            return Err(WalletError::AccountNotFound(posting.user_id.clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO wallet_accounts (user_id, balance, created_at, updated_at)
            VALUES ($1, 0, $2, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(&posting.user_id)
        .bind(posting.created_at)
        .execute(&mut *conn)
        .await
        .map_err(classify_sqlx)?;

        Self::lock_balance(&mut *conn, &posting.user_id)
            .await?
            .ok_or_else(|| WalletError::AccountNotFound(posting.user_id.clone()))
    }

    async fn entry_by_key(conn: &mut PgConnection, key: &str) -> Result<Option<LedgerEntry>> {
        sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT * FROM ledger_entries WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(classify_sqlx)
    }

    async fn refunded_total_in(conn: &mut PgConnection, original_id: EntryId) -> Result<Decimal> {
        sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(credit_amount), 0)
            FROM ledger_entries
            WHERE entry_type = 'refund' AND reference_id = $1
            "#,
        )
        .bind(original_id.to_string())
        .fetch_one(&mut *conn)
        .await
        .map_err(classify_sqlx)
    }

    async fn totals_in(conn: &mut PgConnection, user_id: &str) -> Result<LedgerTotals> {
        let (credits, debits, entries) = sqlx::query_as::<_, (Decimal, Decimal, i64)>(
            r#"
            SELECT COALESCE(SUM(credit_amount), 0),
                   COALESCE(SUM(debit_amount), 0),
                   COUNT(*)
            FROM ledger_entries
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(classify_sqlx)?;

        Ok(LedgerTotals {
            credits,
            debits,
            entries,
        })
    }

    async fn apply(&self, posting: &Posting) -> Result<PostOutcome> {
        let mut tx = self.pool.begin().await.map_err(classify_sqlx)?;

        let previous_balance = Self::lock_or_open(&mut *tx, posting).await?;

        // Same key committed while we waited for the row lock.
        if let Some(existing) = Self::entry_by_key(&mut *tx, &posting.idempotency_key).await? {
            tx.rollback().await.map_err(classify_sqlx)?;
            return Ok(PostOutcome::Duplicate(existing));
        }

        if let Some(original) = &posting.refund_of {
            let already = Self::refunded_total_in(&mut *tx, original.id).await?;
            projection::ensure_refundable(original, already, posting.amount)?;
        }

        let new_balance = projection::next_balance(
            &posting.user_id,
            previous_balance,
            posting.direction,
            posting.amount,
            posting.allow_negative,
        )?;

        sqlx::query(
            r#"
            UPDATE wallet_accounts
            SET balance = $1, updated_at = $2
            WHERE user_id = $3
            "#,
        )
        .bind(new_balance)
        .bind(posting.created_at)
        .bind(&posting.user_id)
        .execute(&mut *tx)
        .await
        .map_err(classify_sqlx)?;

        let inserted = sqlx::query_as::<_, LedgerEntry>(
            r#"
            INSERT INTO ledger_entries (
                id, user_id, entry_type, credit_amount, debit_amount, balance_after,
                idempotency_key, reference_id, actor, reason, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(posting.entry_id)
        .bind(&posting.user_id)
        .bind(posting.entry_type)
        .bind(posting.credit_amount())
        .bind(posting.debit_amount())
        .bind(new_balance)
        .bind(&posting.idempotency_key)
        .bind(&posting.reference_id)
        .bind(posting.actor.to_string())
        .bind(&posting.reason)
        .bind(posting.metadata_with_previous(previous_balance))
        .bind(posting.created_at)
        .fetch_one(&mut *tx)
        .await;

        let entry = match inserted {
            Ok(entry) => entry,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                debug!(
                    idempotency_key = %posting.idempotency_key,
                    "Idempotency key taken concurrently, rolling back"
                );
                drop(tx);
                return match self.find_by_idempotency_key(&posting.idempotency_key).await? {
                    Some(existing) => Ok(PostOutcome::Duplicate(existing)),
                    None => Err(WalletError::Conflict(format!(
                        "unique violation on {} without a visible entry",
                        posting.idempotency_key
                    ))),
                };
            }
            Err(e) => return Err(classify_sqlx(e)),
        };

        tx.commit().await.map_err(classify_sqlx)?;

        Ok(PostOutcome::Posted {
            entry,
            previous_balance,
        })
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<LedgerEntry>> {
        let mut conn = self.pool.acquire().await.map_err(classify_sqlx)?;
        Self::entry_by_key(&mut conn, key).await
    }

    async fn find_entry(&self, id: EntryId) -> Result<Option<LedgerEntry>> {
        sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT * FROM ledger_entries WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx)
    }

    async fn refunded_total(&self, original_id: EntryId) -> Result<Decimal> {
        let mut conn = self.pool.acquire().await.map_err(classify_sqlx)?;
        Self::refunded_total_in(&mut conn, original_id).await
    }

    async fn post(&self, posting: &Posting) -> Result<PostOutcome> {
        self.apply(posting).await.map_err(|e| {
            if matches!(e, WalletError::Storage(_)) {
                error!(
                    user_id = %posting.user_id,
                    idempotency_key = %posting.idempotency_key,
                    error = %e,
                    "Ledger posting failed"
                );
            }
            e
        })
    }

    async fn rebuild_balance(&self, user_id: &str) -> Result<RebuildOutcome> {
        let mut tx = self.pool.begin().await.map_err(classify_sqlx)?;

        let old_balance = Self::lock_balance(&mut *tx, user_id)
            .await?
            .ok_or_else(|| WalletError::AccountNotFound(user_id.to_string()))?;
        let new_balance = Self::totals_in(&mut *tx, user_id).await?.balance();

        sqlx::query(
            r#"
            UPDATE wallet_accounts
            SET balance = $1, updated_at = $2
            WHERE user_id = $3
            "#,
        )
        .bind(new_balance)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(classify_sqlx)?;

        tx.commit().await.map_err(classify_sqlx)?;

        Ok(RebuildOutcome {
            user_id: user_id.to_string(),
            old_balance,
            new_balance,
            difference: new_balance - old_balance,
        })
    }

    async fn account(&self, user_id: &str) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>(
            r#"
            SELECT user_id, balance, created_at, updated_at
            FROM wallet_accounts
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx)
    }

    async fn ledger_totals(&self, user_id: &str) -> Result<LedgerTotals> {
        let mut conn = self.pool.acquire().await.map_err(classify_sqlx)?;
        Self::totals_in(&mut conn, user_id).await
    }

    async fn account_ids(&self) -> Result<Vec<UserId>> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT user_id FROM wallet_accounts ORDER BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx)
    }

    async fn history(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        query.validate()?;

        let filter = match query.filter {
            EntryFilter::All => "all",
            EntryFilter::Credit => "credit",
            EntryFilter::Debit => "debit",
        };

        const CONDITIONS: &str = r#"
            WHERE user_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND ($3::timestamptz IS NULL OR created_at <= $3)
              AND ($4 = 'all'
                   OR ($4 = 'credit' AND credit_amount > 0)
                   OR ($4 = 'debit' AND debit_amount > 0))
        "#;

        let total = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM ledger_entries {}",
            CONDITIONS
        ))
        .bind(&query.user_id)
        .bind(query.from)
        .bind(query.to)
        .bind(filter)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT * FROM ledger_entries {} ORDER BY created_at DESC, id DESC LIMIT $5 OFFSET $6",
            CONDITIONS
        ))
        .bind(&query.user_id)
        .bind(query.from)
        .bind(query.to)
        .bind(filter)
        .bind(query.limit)
        .bind(query.offset())
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        Ok(HistoryPage {
            entries,
            total,
            limit: query.limit,
            page: query.page,
        })
    }

    async fn stats(&self, day: NaiveDate) -> Result<WalletStats> {
        let (accounts, total_balance) = sqlx::query_as::<_, (i64, Decimal)>(
            r#"
            SELECT COUNT(*), COALESCE(SUM(balance), 0) FROM wallet_accounts
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        let (start, end) = day_bounds(day);
        let (day_credits, day_debits, day_top_ups) = sqlx::query_as::<_, (Decimal, Decimal, i64)>(
            r#"
            SELECT COALESCE(SUM(credit_amount), 0),
                   COALESCE(SUM(debit_amount), 0),
                   COUNT(*) FILTER (WHERE entry_type = 'top_up')
            FROM ledger_entries
            WHERE created_at >= $1 AND created_at < $2
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        Ok(WalletStats {
            day: Some(day),
            accounts,
            total_balance,
            day_credits,
            day_debits,
            day_net: day_credits - day_debits,
            day_top_ups,
        })
    }
}
