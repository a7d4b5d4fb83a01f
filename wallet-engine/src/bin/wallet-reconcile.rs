//! One-shot reconciliation.
//!
//! ```text
//! wallet-reconcile [--user=<id>] [--fix] [--tolerance=<amount>]
//! ```
//!
//! Prints the report as JSON. Exits 1 when any account is out of tolerance,
//! 2 on usage errors.

use rust_decimal::Decimal;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use wallet_engine::cache::LocalBalanceCache;
use wallet_engine::store::PgLedgerStore;
use wallet_engine::{
    database, telemetry, Config, ReconciliationJob, ReconciliationScope, WalletEngine,
};

#[derive(Debug, Default, PartialEq)]
struct Args {
    user: Option<String>,
    fix: bool,
    tolerance: Option<Decimal>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args::default();

    for arg in args {
        if arg == "--fix" {
            parsed.fix = true;
        } else if let Some(user) = arg.strip_prefix("--user=") {
            if user.is_empty() {
                return Err("--user needs a value".to_string());
            }
            parsed.user = Some(user.to_string());
        } else if let Some(raw) = arg.strip_prefix("--tolerance=") {
            let tolerance = Decimal::from_str(raw)
                .map_err(|e| format!("invalid --tolerance '{}': {}", raw, e))?;
            if tolerance < Decimal::ZERO {
                return Err("--tolerance cannot be negative".to_string());
            }
            parsed.tolerance = Some(tolerance);
        } else {
            return Err(format!("unknown argument: {}", arg));
        }
    }

    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenv::dotenv().ok();
    telemetry::init_tracing();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("usage: wallet-reconcile [--user=<id>] [--fix] [--tolerance=<amount>]");
            return Ok(ExitCode::from(2));
        }
    };

    let config = Config::from_env()?;
    config.validate().map_err(anyhow::Error::msg)?;

    let pool = database::create_pool(&config.database).await?;
    let store = Arc::new(PgLedgerStore::new(pool.clone()));
    let cache = Arc::new(LocalBalanceCache::new(config.wallet.balance_cache_ttl_secs));
    let engine = Arc::new(WalletEngine::from_config(store, cache, &config)?);

    let mut job = ReconciliationJob::new(engine)
        .with_alarm_after_runs(config.reconciliation.alarm_after_runs);
    if let Some(tolerance) = args.tolerance {
        job = job.with_tolerance(tolerance);
    }

    let scope = match args.user {
        Some(user) => ReconciliationScope::Account(user),
        None => ReconciliationScope::All,
    };

    if args.fix {
        warn!("Auto-fix enabled: cached balances will be rebuilt from the ledger");
    }

    let report = job.run(scope, args.fix).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    pool.close().await;

    if report.has_discrepancies() {
        info!(
            discrepancies = report.discrepancies.len(),
            fixed = report.fixed.len(),
            "Discrepancies found"
        );
        return Ok(ExitCode::from(1));
    }

    info!("All wallet balances reconciled");
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, String> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults() {
        assert_eq!(args(&[]).unwrap(), Args::default());
    }

    #[test]
    fn test_all_flags() {
        let parsed = args(&["--user=42", "--fix", "--tolerance=0.05"]).unwrap();
        assert_eq!(parsed.user.as_deref(), Some("42"));
        assert!(parsed.fix);
        assert_eq!(parsed.tolerance, Some(Decimal::new(5, 2)));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(args(&["--tolerance=abc"]).is_err());
        assert!(args(&["--tolerance=-1"]).is_err());
        assert!(args(&["--user="]).is_err());
        assert!(args(&["--verbose"]).is_err());
    }
}
