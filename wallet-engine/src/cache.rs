//! Read-through cache for `get_balance`.
//!
//! Cached values are display-only: money decisions always read the locked
//! account row. Every successful write invalidates the user's entry after
//! commit.

use crate::metrics::{BALANCE_CACHE_HITS, BALANCE_CACHE_MISSES};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Default TTL for a cached balance (seconds)
pub const DEFAULT_TTL_SECS: u64 = 60;

/// Cache key prefix
pub const KEY_PREFIX: &str = "wallet:balance";

pub fn balance_key(user_id: &str) -> String {
    format!("{}:{}", KEY_PREFIX, user_id)
}

#[derive(Default, Debug, Clone, Copy, PartialEq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64) / (total as f64) * 100.0
        }
    }
}

#[derive(Default)]
struct MetricsCell(RwLock<CacheMetrics>);

impl MetricsCell {
    fn hit(&self) {
        self.0.write().hits += 1;
        BALANCE_CACHE_HITS.inc();
    }

    fn miss(&self) {
        self.0.write().misses += 1;
        BALANCE_CACHE_MISSES.inc();
    }

    fn set(&self) {
        self.0.write().sets += 1;
    }

    fn delete(&self) {
        self.0.write().deletes += 1;
    }

    fn snapshot(&self) -> CacheMetrics {
        *self.0.read()
    }
}

/// Balance cache. Failures never reach callers; a broken cache behaves as a
/// permanent miss.
#[async_trait]
pub trait BalanceCache: Send + Sync {
    async fn get(&self, user_id: &str) -> Option<Decimal>;

    async fn put(&self, user_id: &str, balance: Decimal);

    async fn invalidate(&self, user_id: &str);

    fn metrics(&self) -> CacheMetrics;
}

#[derive(Clone)]
pub struct RedisBalanceCache {
    redis: ConnectionManager,
    ttl_secs: u64,
    metrics: Arc<MetricsCell>,
}

impl RedisBalanceCache {
    pub fn new(redis: ConnectionManager, ttl_secs: u64) -> Self {
        Self {
            redis,
            ttl_secs,
            metrics: Arc::new(MetricsCell::default()),
        }
    }

    pub async fn connect(url: &str, ttl_secs: u64) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::new(manager, ttl_secs))
    }
}

#[async_trait]
impl BalanceCache for RedisBalanceCache {
    async fn get(&self, user_id: &str) -> Option<Decimal> {
        let key = balance_key(user_id);

        match self.redis.clone().get::<_, Option<String>>(&key).await {
            Ok(Some(raw)) => match Decimal::from_str(&raw) {
                Ok(balance) => {
                    self.metrics.hit();
                    Some(balance)
                }
                Err(e) => {
                    warn!(user_id, "Discarding unparsable cached balance: {}", e);
                    self.metrics.miss();
                    None
                }
            },
            Ok(None) => {
                self.metrics.miss();
                None
            }
            Err(e) => {
                error!(user_id, "Redis error reading balance: {}", e);
                self.metrics.miss();
                None
            }
        }
    }

    async fn put(&self, user_id: &str, balance: Decimal) {
        let key = balance_key(user_id);
        let result: Result<(), redis::RedisError> = self
            .redis
            .clone()
            .set_ex(&key, balance.to_string(), self.ttl_secs)
            .await;

        match result {
            Ok(()) => self.metrics.set(),
            Err(e) => error!(user_id, "Redis error caching balance: {}", e),
        }
    }

    async fn invalidate(&self, user_id: &str) {
        let key = balance_key(user_id);
        let result: Result<(), redis::RedisError> = self.redis.clone().del(&key).await;

        match result {
            Ok(()) => {
                self.metrics.delete();
                debug!(user_id, "Invalidated cached balance");
            }
            Err(e) => error!(user_id, "Redis error invalidating balance: {}", e),
        }
    }

    fn metrics(&self) -> CacheMetrics {
        self.metrics.snapshot()
    }
}

/// In-process cache used when no Redis URL is configured.
#[derive(Default)]
pub struct LocalBalanceCache {
    entries: DashMap<String, (Decimal, Instant)>,
    ttl: Duration,
    metrics: MetricsCell,
}

impl LocalBalanceCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
            metrics: MetricsCell::default(),
        }
    }
}

#[async_trait]
impl BalanceCache for LocalBalanceCache {
    async fn get(&self, user_id: &str) -> Option<Decimal> {
        let cached = self
            .entries
            .get(user_id)
            .map(|entry| *entry.value());

        match cached {
            Some((balance, expires_at)) if Instant::now() < expires_at => {
                self.metrics.hit();
                Some(balance)
            }
            Some(_) => {
                self.entries.remove(user_id);
                self.metrics.miss();
                None
            }
            None => {
                self.metrics.miss();
                None
            }
        }
    }

    async fn put(&self, user_id: &str, balance: Decimal) {
        self.entries
            .insert(user_id.to_string(), (balance, Instant::now() + self.ttl));
        self.metrics.set();
    }

    async fn invalidate(&self, user_id: &str) {
        if self.entries.remove(user_id).is_some() {
            self.metrics.delete();
        }
    }

    fn metrics(&self) -> CacheMetrics {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_cache_metrics_hit_rate() {
        let mut metrics = CacheMetrics::default();
        assert_eq!(metrics.hit_rate(), 0.0);

        metrics.hits = 8;
        metrics.misses = 2;
        assert_eq!(metrics.hit_rate(), 80.0);
    }

    #[test]
    fn test_balance_key_format() {
        assert_eq!(balance_key("42"), "wallet:balance:42");
    }

    #[tokio::test]
    async fn test_local_cache_put_get_invalidate() {
        let cache = LocalBalanceCache::new(60);
        assert_eq!(cache.get("u1").await, None);

        cache.put("u1", dec!(70.00)).await;
        assert_eq!(cache.get("u1").await, Some(dec!(70.00)));

        cache.invalidate("u1").await;
        assert_eq!(cache.get("u1").await, None);

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 2);
        assert_eq!(metrics.sets, 1);
        assert_eq!(metrics.deletes, 1);
    }

    #[tokio::test]
    async fn test_local_cache_expires() {
        let cache = LocalBalanceCache::new(0);
        cache.put("u1", dec!(5.00)).await;
        assert_eq!(cache.get("u1").await, None);
    }
}
