pub mod metrics;
pub mod store;

pub use metrics::{parse_counter, parse_counters, CacheCounters, MetricsReader, MetricsSource};
pub use store::{CumulativeStats, StatsStore};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Grand totals with the derived hit rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub counters: CacheCounters,
    /// Fraction in `0.0..=1.0`
    pub hit_rate: f64,
}

impl StatsReport {
    pub fn new(counters: CacheCounters) -> Self {
        Self {
            counters,
            hit_rate: hit_rate(&counters),
        }
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queries={} hits={} misses={} lazy_hits={} hit_rate={:.2}%",
            self.counters.query,
            self.counters.hit,
            self.counters.miss,
            self.counters.lazy_hit,
            self.hit_rate * 100.0
        )
    }
}

/// `hit / query`, or `hit / (hit + miss)` when no queries were counted
pub fn hit_rate(counters: &CacheCounters) -> f64 {
    if counters.query > 0 {
        return counters.hit as f64 / counters.query as f64;
    }

    let answered = counters.hit.saturating_add(counters.miss);
    if answered > 0 {
        counters.hit as f64 / answered as f64
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_from_queries() {
        let report = StatsReport::new(CacheCounters::new(200, 150, 50, 3));
        assert!((report.hit_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(
            report.to_string(),
            "queries=200 hits=150 misses=50 lazy_hits=3 hit_rate=75.00%"
        );
    }

    #[test]
    fn test_hit_rate_falls_back_to_hit_plus_miss() {
        let rate = hit_rate(&CacheCounters::new(0, 30, 10, 0));
        assert!((rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hit_rate_empty() {
        assert_eq!(hit_rate(&CacheCounters::default()), 0.0);
    }
}
