use crate::config::StatsConfig;
use crate::shutdown::ShutdownSignal;
use crate::stats::{StatsReport, StatsStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Periodically logs the cumulative cache statistics
pub struct StatsReporter {
    stats: Arc<StatsStore>,
    initial_delay: Duration,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(config: &StatsConfig, stats: Arc<StatsStore>) -> Self {
        Self {
            stats,
            initial_delay: Duration::from_secs(config.report_initial_delay_secs),
            interval: Duration::from_secs(config.report_interval_secs),
        }
    }

    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut wait = self.initial_delay;

        loop {
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.cancelled() => return,
            }
            wait = self.interval;

            if let Some(report) = self.report().await {
                info!(
                    query = report.counters.query,
                    hit = report.counters.hit,
                    "Cache stats: {}",
                    report
                );
            }
        }
    }

    /// Current totals, or `None` while the resolver is not answering
    pub async fn report(&self) -> Option<StatsReport> {
        if let Err(e) = self.stats.snapshot().await {
            if e.is_transient() {
                debug!("Skipping stats report: {}", e);
            } else {
                warn!("Skipping stats report: {}", e);
            }
            return None;
        }

        Some(StatsReport::new(self.stats.total().await))
    }
}
