use crate::config::{CounterNames, MetricsConfig};
use crate::error::{DnsvisorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::Add;

/// The four cache counters the resolver exposes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounters {
    pub query: u64,
    pub hit: u64,
    pub miss: u64,
    pub lazy_hit: u64,
}

impl CacheCounters {
    pub fn new(query: u64, hit: u64, miss: u64, lazy_hit: u64) -> Self {
        Self {
            query,
            hit,
            miss,
            lazy_hit,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.query == 0 && self.hit == 0 && self.miss == 0 && self.lazy_hit == 0
    }
}

impl Add for CacheCounters {
    type Output = CacheCounters;

    fn add(self, other: CacheCounters) -> CacheCounters {
        CacheCounters {
            query: self.query.saturating_add(other.query),
            hit: self.hit.saturating_add(other.hit),
            miss: self.miss.saturating_add(other.miss),
            lazy_hit: self.lazy_hit.saturating_add(other.lazy_hit),
        }
    }
}

/// Point-in-time view of the live resolver's counters
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Fails with [`DnsvisorError::Unreachable`] when the resolver is not serving
    async fn snapshot(&self) -> Result<CacheCounters>;
}

/// Reads counters from the resolver's HTTP metrics endpoint
pub struct MetricsReader {
    client: reqwest::Client,
    url: String,
    names: CounterNames,
}

impl MetricsReader {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| DnsvisorError::Other(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            names: config.counters.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MetricsSource for MetricsReader {
    async fn snapshot(&self) -> Result<CacheCounters> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| DnsvisorError::Unreachable(format!("{}: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DnsvisorError::MetricsStatus(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DnsvisorError::Unreachable(format!("{}: {}", self.url, e)))?;

        Ok(parse_counters(&body, &self.names))
    }
}

/// Extract the four cache counters from exposition text
pub fn parse_counters(text: &str, names: &CounterNames) -> CacheCounters {
    CacheCounters {
        query: parse_counter(text, &names.query),
        hit: parse_counter(text, &names.hit),
        miss: parse_counter(text, &names.miss),
        lazy_hit: parse_counter(text, &names.lazy_hit),
    }
}

/// Value of one counter, `0` when absent or unparsable
///
/// Labelled series (`name{tag="a"} 12`) are summed; a bare series
/// (`name 12`) is used only when no labelled one exists. Values may use
/// scientific notation and may be followed by a timestamp.
pub fn parse_counter(text: &str, name: &str) -> u64 {
    let mut labelled: Option<f64> = None;
    let mut bare: Option<f64> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }

        let Some(rest) = line.strip_prefix(name) else {
            continue;
        };

        if let Some(labels) = rest.strip_prefix('{') {
            let Some(end) = labels.find('}') else {
                continue;
            };
            if let Some(value) = parse_sample_value(&labels[end + 1..]) {
                labelled = Some(labelled.unwrap_or(0.0) + value);
            }
        } else if rest.starts_with(char::is_whitespace) {
            if bare.is_none() {
                bare = parse_sample_value(rest);
            }
        }
    }

    let value = labelled.or(bare).unwrap_or(0.0);
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}

fn parse_sample_value(rest: &str) -> Option<f64> {
    rest.split_whitespace()
        .next()
        .and_then(|token| token.parse::<f64>().ok())
}
