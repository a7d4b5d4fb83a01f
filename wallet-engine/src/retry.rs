// Retry policy for atomic wallet units: exponential backoff with jitter,
// applied only to transient storage contention.

use crate::error::{Result, WalletError};
use crate::metrics::WALLET_RETRIES_TOTAL;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 50,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests and benches.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Delay before retry number `retry` (0-based)
    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.delay_for(attempt - 2);
                WALLET_RETRIES_TOTAL
                    .with_label_values(&[operation_name])
                    .inc();
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient conflict"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = operation_name,
                            attempt, "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }

        Err(WalletError::TransientFailure {
            attempts: max_attempts,
            last_error,
        })
    }
}
