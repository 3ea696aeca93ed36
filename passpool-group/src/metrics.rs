use prometheus::{IntCounter, Registry};

/// Counters for the rebalance retry loop
#[derive(Clone)]
pub struct RebalanceMetrics {
    pub attempts: IntCounter,
    pub conflicts: IntCounter,
    pub timeouts: IntCounter,
    pub commits: IntCounter,
    pub exhausted: IntCounter,
}

impl RebalanceMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            attempts: IntCounter::new("passpool_rebalance_attempts_total", "Rebalance attempts started")?,
            conflicts: IntCounter::new("passpool_rebalance_conflicts_total", "Commits rejected by a version conflict")?,
            timeouts: IntCounter::new("passpool_rebalance_timeouts_total", "Attempts that exceeded their time budget")?,
            commits: IntCounter::new("passpool_rebalance_commits_total", "Committed trip changes")?,
            exhausted: IntCounter::new("passpool_rebalance_exhausted_total", "Operations that ran out of attempts")?,
        };

        registry.register(Box::new(metrics.attempts.clone()))?;
        registry.register(Box::new(metrics.conflicts.clone()))?;
        registry.register(Box::new(metrics.timeouts.clone()))?;
        registry.register(Box::new(metrics.commits.clone()))?;
        registry.register(Box::new(metrics.exhausted.clone()))?;

        Ok(metrics)
    }
}
