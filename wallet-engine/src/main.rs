use std::sync::Arc;
use tracing::{debug, error, info};
use wallet_engine::cache::{BalanceCache, LocalBalanceCache, RedisBalanceCache};
use wallet_engine::store::PgLedgerStore;
use wallet_engine::{
    database, metrics, telemetry, Config, ReconciliationJob, ReconciliationScheduler,
    WalletEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    telemetry::init_tracing();

    info!("Wallet Engine starting...");

    let config = Config::from_env()?;
    config.validate().map_err(anyhow::Error::msg)?;

    info!(
        max_attempts = config.wallet.max_attempts,
        minor_unit_scale = config.wallet.minor_unit_scale,
        reconciliation_enabled = config.reconciliation.enabled,
        "Configuration loaded"
    );

    let registry = prometheus::Registry::new();
    metrics::register_metrics(&registry)?;

    let pool = database::create_pool(&config.database).await?;
    database::run_migrations(&pool).await?;

    let cache: Arc<dyn BalanceCache> = if config.redis.url.is_empty() {
        info!("No Redis URL configured, using in-process balance cache");
        Arc::new(LocalBalanceCache::new(config.wallet.balance_cache_ttl_secs))
    } else {
        match RedisBalanceCache::connect(&config.redis.url, config.wallet.balance_cache_ttl_secs).await {
            Ok(cache) => {
                info!("Connected to Redis balance cache");
                Arc::new(cache)
            }
            Err(e) => {
                error!("Redis unavailable ({}), falling back to in-process cache", e);
                Arc::new(LocalBalanceCache::new(config.wallet.balance_cache_ttl_secs))
            }
        }
    };

    let store = Arc::new(PgLedgerStore::new(pool.clone()));
    let engine = Arc::new(WalletEngine::from_config(store, cache, &config)?);

    let mut scheduler = if config.reconciliation.enabled {
        let job = Arc::new(
            ReconciliationJob::new(engine.clone())
                .with_alarm_after_runs(config.reconciliation.alarm_after_runs),
        );
        let mut scheduler = ReconciliationScheduler::new(
            job,
            &config.reconciliation.schedule,
            config.reconciliation.auto_fix,
        )
        .await?;
        scheduler.start().await?;
        if let Some(next) = scheduler.next_run().await? {
            info!(next_run = %next, "Next reconciliation scheduled");
        }
        Some(scheduler)
    } else {
        info!("Scheduled reconciliation disabled");
        None
    };

    info!("Wallet Engine initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.stop().await?;
    }

    match metrics::render(&registry) {
        Ok(snapshot) => debug!("Final metrics:\n{}", snapshot),
        Err(e) => error!("Failed to render metrics: {}", e),
    }

    pool.close().await;
    info!("Wallet Engine stopped");

    Ok(())
}
