// Reconciliation Job - sweeps accounts, reports drift and tracks sustained
// mismatches across runs

use super::{reconcile_account, AccountReconciliation};
use crate::engine::WalletEngine;
use crate::error::{Result, WalletError};
use crate::metrics::{RECONCILIATION_ALARMS, RECONCILIATION_DISCREPANCIES, RECONCILIATION_RUNS_TOTAL};
use crate::types::{RebuildOutcome, UserId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Actor recorded when the job repairs a balance.
pub const AUTO_FIX_ACTOR: &str = "reconciliation-job";

pub const DEFAULT_ALARM_AFTER_RUNS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationScope {
    All,
    Account(UserId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub user_id: UserId,
    pub cached_balance: Decimal,
    pub ledger_balance: Decimal,
    pub discrepancy: Decimal,
    /// Consecutive runs this account has been out of tolerance, this one included.
    pub consecutive_runs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scope: ReconciliationScope,
    pub tolerance: Decimal,
    pub auto_fix: bool,
    pub accounts_checked: usize,
    pub failed: usize,
    pub discrepancies: Vec<Discrepancy>,
    pub fixed: Vec<RebuildOutcome>,
    /// Accounts whose mismatch has persisted for `alarm_after_runs` runs.
    pub alarms: Vec<UserId>,
}

impl ReconciliationReport {
    pub fn has_discrepancies(&self) -> bool {
        !self.discrepancies.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty() && self.failed == 0
    }
}

pub struct ReconciliationJob {
    engine: Arc<WalletEngine>,
    tolerance: Decimal,
    alarm_after_runs: u32,
    streaks: DashMap<UserId, u32>,
}

impl ReconciliationJob {
    pub fn new(engine: Arc<WalletEngine>) -> Self {
        let tolerance = engine.tolerance();
        Self {
            engine,
            tolerance,
            alarm_after_runs: DEFAULT_ALARM_AFTER_RUNS,
            streaks: DashMap::new(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: Decimal) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_alarm_after_runs(mut self, runs: u32) -> Self {
        self.alarm_after_runs = runs.max(1);
        self
    }

    /// Current mismatch streak for an account.
    pub fn consecutive_mismatches(&self, user_id: &str) -> u32 {
        self.streaks.get(user_id).map(|s| *s.value()).unwrap_or(0)
    }

    /// Run one sweep. Per-account read failures are logged and counted; the
    /// sweep carries on. With `auto_fix`, each out-of-tolerance account is
    /// rebuilt from its ledger.
    pub async fn run(&self, scope: ReconciliationScope, auto_fix: bool) -> Result<ReconciliationReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let store = self.engine.store();
        let scale = self.engine.minor_unit_scale();

        info!(%run_id, ?scope, auto_fix, tolerance = %self.tolerance, "Starting wallet reconciliation");

        let user_ids = match &scope {
            ReconciliationScope::All => store.account_ids().await?,
            ReconciliationScope::Account(user_id) => vec![user_id.clone()],
        };

        let mut report = ReconciliationReport {
            run_id,
            started_at,
            finished_at: started_at,
            scope: scope.clone(),
            tolerance: self.tolerance,
            auto_fix,
            accounts_checked: 0,
            failed: 0,
            discrepancies: Vec::new(),
            fixed: Vec::new(),
            alarms: Vec::new(),
        };

        for user_id in &user_ids {
            let checked = match reconcile_account(store.as_ref(), user_id, self.tolerance, scale).await {
                Ok(checked) => checked,
                Err(e @ WalletError::AccountNotFound(_))
                    if matches!(scope, ReconciliationScope::Account(_)) =>
                {
                    return Err(e);
                }
                Err(e) => {
                    error!(%run_id, user_id = %user_id, "Failed to reconcile account: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            report.accounts_checked += 1;

            if checked.is_valid {
                if self.streaks.remove(user_id).is_some() {
                    info!(%run_id, user_id = %user_id, "Balance mismatch resolved");
                }
                continue;
            }

            let streak = self.record_mismatch(user_id);
            self.log_mismatch(run_id, &checked, streak);
            if streak >= self.alarm_after_runs {
                report.alarms.push(user_id.clone());
            }

            report.discrepancies.push(Discrepancy {
                user_id: user_id.clone(),
                cached_balance: checked.cached_balance,
                ledger_balance: checked.ledger_balance,
                discrepancy: checked.discrepancy,
                consecutive_runs: streak,
            });

            if auto_fix {
                match self.engine.rebuild_balance(user_id, AUTO_FIX_ACTOR).await {
                    Ok(outcome) => {
                        self.streaks.remove(user_id);
                        report.fixed.push(outcome);
                    }
                    Err(e) => {
                        error!(%run_id, user_id = %user_id, "Auto-fix failed: {}", e);
                        report.failed += 1;
                    }
                }
            }
        }

        report.finished_at = Utc::now();

        RECONCILIATION_DISCREPANCIES.set(report.discrepancies.len() as i64);
        RECONCILIATION_ALARMS
            .with_label_values(&["sustained"])
            .set(report.alarms.len() as i64);
        RECONCILIATION_RUNS_TOTAL
            .with_label_values(&[if report.has_discrepancies() { "discrepancies" } else { "clean" }])
            .inc();

        info!(
            %run_id,
            accounts_checked = report.accounts_checked,
            discrepancies = report.discrepancies.len(),
            fixed = report.fixed.len(),
            failed = report.failed,
            alarms = report.alarms.len(),
            "Wallet reconciliation finished"
        );

        Ok(report)
    }

    fn record_mismatch(&self, user_id: &str) -> u32 {
        let mut streak = self.streaks.entry(user_id.to_string()).or_insert(0);
        *streak += 1;
        *streak
    }

    fn log_mismatch(&self, run_id: Uuid, checked: &AccountReconciliation, streak: u32) {
        if streak >= self.alarm_after_runs {
            error!(
                %run_id,
                user_id = %checked.user_id,
                cached_balance = %checked.cached_balance,
                ledger_balance = %checked.ledger_balance,
                discrepancy = %checked.discrepancy,
                consecutive_runs = streak,
                "Sustained wallet balance mismatch"
            );
        } else {
            warn!(
                %run_id,
                user_id = %checked.user_id,
                cached_balance = %checked.cached_balance,
                ledger_balance = %checked.ledger_balance,
                discrepancy = %checked.discrepancy,
                "Wallet balance mismatch"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_cleanliness() {
        let now = Utc::now();
        let mut report = ReconciliationReport {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            scope: ReconciliationScope::All,
            tolerance: Decimal::new(1, 2),
            auto_fix: false,
            accounts_checked: 3,
            failed: 0,
            discrepancies: Vec::new(),
            fixed: Vec::new(),
            alarms: Vec::new(),
        };
        assert!(report.is_clean());

        report.failed = 1;
        assert!(!report.is_clean());
        assert!(!report.has_discrepancies());
    }
}
