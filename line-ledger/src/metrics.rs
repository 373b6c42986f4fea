//! Metrics collection for observability
//!
//! Prometheus metrics for the settlement lines of one node. Every node owns
//! its registry, so several nodes can live in one process.
//!
//! # Metrics
//!
//! - `line_reservations_total` - Reservations granted
//! - `line_reservation_rejections_total` - Reservations refused for lack of capacity
//! - `line_reservations_expired_total` - Reservations removed by the TTL sweep
//! - `line_commits_total` - Amounts settled into balances
//! - `line_open_lines` - Lines currently known

use prometheus::{IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Reservations granted
    pub reservations_total: IntCounter,

    /// Reservations refused
    pub reservation_rejections: IntCounter,

    /// Reservations expired by the sweeper
    pub reservations_expired: IntCounter,

    /// Settlements applied to balances
    pub commits_total: IntCounter,

    /// Known lines
    pub open_lines: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create metrics registered in an existing registry
    pub fn with_registry(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let reservations_total =
            IntCounter::new("line_reservations_total", "Reservations granted")?;
        registry.register(Box::new(reservations_total.clone()))?;

        let reservation_rejections = IntCounter::new(
            "line_reservation_rejections_total",
            "Reservations refused for lack of capacity",
        )?;
        registry.register(Box::new(reservation_rejections.clone()))?;

        let reservations_expired = IntCounter::new(
            "line_reservations_expired_total",
            "Reservations removed by the TTL sweep",
        )?;
        registry.register(Box::new(reservations_expired.clone()))?;

        let commits_total = IntCounter::new("line_commits_total", "Amounts settled into balances")?;
        registry.register(Box::new(commits_total.clone()))?;

        let open_lines = IntGauge::new("line_open_lines", "Lines currently known")?;
        registry.register(Box::new(open_lines.clone()))?;

        Ok(Self {
            reservations_total,
            reservation_rejections,
            reservations_expired,
            commits_total,
            open_lines,
            registry,
        })
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.reservations_total.get(), 0);
        assert_eq!(metrics.open_lines.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.reservations_total.inc();
        assert_eq!(first.reservations_total.get(), 1);
        assert_eq!(second.reservations_total.get(), 0);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let metrics = Metrics::new().unwrap();
        assert!(Metrics::with_registry(metrics.registry.clone()).is_err());
    }
}
