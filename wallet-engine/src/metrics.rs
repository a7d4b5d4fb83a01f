use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    // Wallet operations
    pub static ref WALLET_OPERATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("wallet_operations_total", "Wallet operations by outcome"),
        &["operation", "outcome"]
    ).expect("metric can be created");

    pub static ref WALLET_OPERATION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("wallet_operation_duration_seconds", "Wallet operation duration in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["operation"]
    ).expect("metric can be created");

    pub static ref WALLET_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("wallet_retries_total", "Atomic units retried after transient contention"),
        &["operation"]
    ).expect("metric can be created");

    // Balance cache
    pub static ref BALANCE_CACHE_HITS: IntCounter = IntCounter::new(
        "wallet_balance_cache_hits_total",
        "Total balance cache hits"
    ).expect("metric can be created");

    pub static ref BALANCE_CACHE_MISSES: IntCounter = IntCounter::new(
        "wallet_balance_cache_misses_total",
        "Total balance cache misses"
    ).expect("metric can be created");

    // Reconciliation
    pub static ref RECONCILIATION_RUNS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("wallet_reconciliation_runs_total", "Reconciliation runs by result"),
        &["result"]
    ).expect("metric can be created");

    pub static ref RECONCILIATION_DISCREPANCIES: IntGauge = IntGauge::new(
        "wallet_reconciliation_discrepancies",
        "Accounts out of tolerance in the last reconciliation run"
    ).expect("metric can be created");

    pub static ref RECONCILIATION_ALARMS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("wallet_reconciliation_alarms", "Accounts with a sustained mismatch"),
        &["severity"]
    ).expect("metric can be created");
}

/// Register all wallet metrics with the given registry
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(WALLET_OPERATIONS_TOTAL.clone()))?;
    registry.register(Box::new(WALLET_OPERATION_DURATION.clone()))?;
    registry.register(Box::new(WALLET_RETRIES_TOTAL.clone()))?;

    registry.register(Box::new(BALANCE_CACHE_HITS.clone()))?;
    registry.register(Box::new(BALANCE_CACHE_MISSES.clone()))?;

    registry.register(Box::new(RECONCILIATION_RUNS_TOTAL.clone()))?;
    registry.register(Box::new(RECONCILIATION_DISCREPANCIES.clone()))?;
    registry.register(Box::new(RECONCILIATION_ALARMS.clone()))?;

    Ok(())
}

/// Render the registry in Prometheus text format
pub fn render(registry: &Registry) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub(crate) fn record_operation(operation: &str, outcome: &str, elapsed: std::time::Duration) {
    WALLET_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    WALLET_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let registry = Registry::new();
        assert!(register_metrics(&registry).is_ok());
    }

    #[test]
    fn test_render_includes_recorded_operations() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();

        record_operation("credit", "success", std::time::Duration::from_millis(3));
        let output = render(&registry).unwrap();
        assert!(output.contains("wallet_operations_total"));
        assert!(output.contains("operation=\"credit\""));
    }
}
