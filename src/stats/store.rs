// Carry-forward accounting of cache counters across resolver restarts

use crate::error::{DnsvisorError, Result};
use crate::stats::metrics::{CacheCounters, MetricsSource};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Persisted record of counters accumulated by earlier resolver runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativeStats {
    #[serde(default, deserialize_with = "lenient_counter")]
    pub query_total: u64,
    #[serde(default, deserialize_with = "lenient_counter")]
    pub hit_total: u64,
    #[serde(default, deserialize_with = "lenient_counter")]
    pub miss_total: u64,
    #[serde(default, alias = "lazy_total", deserialize_with = "lenient_counter")]
    pub lazy_hit_total: u64,
    /// Unix seconds of the last carry
    #[serde(default)]
    pub updated_at: i64,
}

impl CumulativeStats {
    pub fn counters(&self) -> CacheCounters {
        CacheCounters::new(
            self.query_total,
            self.hit_total,
            self.miss_total,
            self.lazy_hit_total,
        )
    }

    /// Fold a live snapshot into the record
    pub fn accumulate(&mut self, live: &CacheCounters) {
        let sum = self.counters() + *live;
        self.query_total = sum.query;
        self.hit_total = sum.hit;
        self.miss_total = sum.miss;
        self.lazy_hit_total = sum.lazy_hit;
        self.updated_at = unix_now();
    }
}

/// Accept integers and floats (older records were written as floats)
fn lenient_counter<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if value.is_finite() && value > 0.0 {
        Ok(value.round() as u64)
    } else {
        Ok(0)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Restart-surviving accumulator of the resolver's cache counters
///
/// The live endpoint resets to zero whenever the resolver restarts, so the
/// grand total is always `persisted + live` provided [`StatsStore::carry`]
/// runs before every termination of the child.
pub struct StatsStore {
    path: PathBuf,
    source: Arc<dyn MetricsSource>,
    /// Serializes read-accumulate-write against clear
    write_lock: Mutex<()>,
    /// Generation of the child currently serving the endpoint, 0 when none is up
    live_generation: AtomicU64,
    /// Generation whose live counters belong to the flushed period, 0 when none
    flushed_generation: AtomicU64,
}

impl StatsStore {
    pub fn new<P: AsRef<Path>>(path: P, source: Arc<dyn MetricsSource>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            source,
            write_lock: Mutex::new(()),
            live_generation: AtomicU64::new(0),
            flushed_generation: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record which child generation the live endpoint belongs to
    ///
    /// The supervisor publishes the generation on launch and `None` once the
    /// child has exited and been carried.
    pub fn set_live_generation(&self, generation: Option<u64>) {
        self.live_generation
            .store(generation.unwrap_or(0), Ordering::Release);
    }

    /// Whether the live counters belong to a child that was up when `clear` ran
    fn live_is_flushed(&self) -> bool {
        let live = self.live_generation.load(Ordering::Acquire);
        live != 0 && self.flushed_generation.load(Ordering::Acquire) == live
    }

    /// Live counters of the running resolver
    pub async fn snapshot(&self) -> Result<CacheCounters> {
        self.source.snapshot().await
    }

    /// Persisted record; a missing or corrupt file reads as all zeros
    pub fn load(&self) -> CumulativeStats {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(_) => return CumulativeStats::default(),
        };

        serde_json::from_slice(&data).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), "Ignoring unreadable stats record: {}", e);
            CumulativeStats::default()
        })
    }

    /// Fold the live counters into the persisted record
    ///
    /// Must run before the child is terminated. Returns `Ok(true)` when the
    /// record was updated and `Ok(false)` when there was nothing to add: the
    /// endpoint was unreachable, every counter was zero, or the counters
    /// belonged to a run that was flushed.
    pub async fn carry(&self) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let flushed = self.live_is_flushed();
        if flushed {
            self.flushed_generation.store(0, Ordering::Release);
        }

        let live = match self.source.snapshot().await {
            Ok(live) => live,
            Err(e) => {
                debug!("No live counters to carry: {}", e);
                return Ok(false);
            }
        };

        if flushed {
            debug!("Discarding counters of a flushed run");
            return Ok(false);
        }

        if live.is_zero() {
            return Ok(false);
        }

        let mut record = self.load();
        record.accumulate(&live);
        self.save(&record)?;

        info!(
            query = record.query_total,
            hit = record.hit_total,
            "Carried resolver counters forward"
        );

        Ok(true)
    }

    /// Grand total: persisted plus whatever the live resolver reports now
    pub async fn total(&self) -> CacheCounters {
        let persisted = self.load().counters();

        if self.live_is_flushed() {
            return persisted;
        }

        match self.source.snapshot().await {
            Ok(live) => persisted + live,
            Err(_) => persisted,
        }
    }

    /// Delete the persisted record
    ///
    /// The live counters of the child running right now are treated as part
    /// of the flushed period until it is replaced. A child launched after the
    /// flush is accounted normally.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(DnsvisorError::StatsSaveError(format!(
                    "Failed to remove stats record: {}",
                    e
                )))
            }
        }

        let live = self.live_generation.load(Ordering::Acquire);
        self.flushed_generation.store(live, Ordering::Release);
        info!(path = %self.path.display(), "Cleared carried stats");
        Ok(())
    }

    /// Write the record with a temp file and rename so readers never see a partial file
    fn save(&self, record: &CumulativeStats) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DnsvisorError::StatsSaveError(format!("Failed to create stats directory: {}", e))
            })?;
        }

        let temp_path = self.path.with_extension("tmp");

        {
            let file = File::create(&temp_path).map_err(|e| {
                DnsvisorError::StatsSaveError(format!("Failed to create temp stats file: {}", e))
            })?;

            let mut writer = BufWriter::new(file);

            serde_json::to_writer_pretty(&mut writer, record).map_err(|e| {
                DnsvisorError::StatsSaveError(format!("Failed to serialize stats: {}", e))
            })?;

            writer.flush().map_err(|e| {
                DnsvisorError::StatsSaveError(format!("Failed to flush stats file: {}", e))
            })?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            DnsvisorError::StatsSaveError(format!("Failed to rename temp stats file: {}", e))
        })?;

        Ok(())
    }
}
