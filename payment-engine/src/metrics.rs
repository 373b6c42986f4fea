//! Transaction metrics of one node
//!
//! Registered in the same registry as the line ledger metrics, so one
//! scrape covers the whole node.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Node metrics
#[derive(Clone, Debug)]
pub struct NodeMetrics {
    /// Coordinated transactions by outcome
    pub transactions_total: IntCounterVec,

    /// Transactions currently coordinated
    pub active_transactions: IntGauge,

    /// Recovery procedures started
    pub recoveries_total: IntCounter,

    /// Claims submitted to the observing ledger
    pub claims_total: IntCounter,

    /// Paths that failed to reserve
    pub failed_paths_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl NodeMetrics {
    /// Create metrics registered in an existing registry
    pub fn with_registry(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let transactions_total = IntCounterVec::new(
            Opts::new("payment_transactions_total", "Coordinated transactions by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(transactions_total.clone()))?;

        let active_transactions =
            IntGauge::new("payment_active_transactions", "Transactions currently coordinated")?;
        registry.register(Box::new(active_transactions.clone()))?;

        let recoveries_total =
            IntCounter::new("payment_recoveries_total", "Recovery procedures started")?;
        registry.register(Box::new(recoveries_total.clone()))?;

        let claims_total = IntCounter::new(
            "payment_observing_claims_total",
            "Claims submitted to the observing ledger",
        )?;
        registry.register(Box::new(claims_total.clone()))?;

        let failed_paths_total =
            IntCounter::new("payment_failed_paths_total", "Paths that failed to reserve")?;
        registry.register(Box::new(failed_paths_total.clone()))?;

        Ok(Self {
            transactions_total,
            active_transactions,
            recoveries_total,
            claims_total,
            failed_paths_total,
            registry,
        })
    }

    /// Count a finished transaction
    pub fn record_outcome(&self, outcome: &str) {
        self.transactions_total.with_label_values(&[outcome]).inc();
    }
}
