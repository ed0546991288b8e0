use crate::config::{RuleSource, ScheduleConfig};
use crate::error::{DnsvisorError, Result};
use crate::process::RestartSignal;
use crate::schedule::cron::MaintenanceTask;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of one refresh over all rule sources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleUpdateSummary {
    pub updated: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
    pub failed: Vec<(String, String)>,
    pub restart_requested: bool,
}

/// Refreshes the resolver's downloadable rule lists
pub struct RuleUpdater {
    client: reqwest::Client,
    sources: Vec<RuleSource>,
    min_bytes: usize,
    restart: RestartSignal,
    /// Directory whose changes the file watcher already turns into a restart
    watched_dir: Option<PathBuf>,
}

impl RuleUpdater {
    pub fn new(config: &ScheduleConfig, restart: RestartSignal) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.download_timeout())
            .build()
            .map_err(|e| DnsvisorError::Other(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            sources: config.rule_sources.clone(),
            min_bytes: config.min_rule_bytes,
            restart,
            watched_dir: None,
        })
    }

    /// Leave the restart for lists installed under `dir` to the file watcher
    pub fn watched_by<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.watched_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    fn is_watched(&self, dest: &Path) -> bool {
        self.watched_dir
            .as_ref()
            .is_some_and(|dir| dest.starts_with(dir))
    }

    /// Download every source and install the ones whose content changed
    ///
    /// A failing source is recorded and skipped. When at least one file was
    /// replaced the resolver is restarted once: directly if a replaced file
    /// lies outside the watched directory, by the file watcher otherwise.
    pub async fn refresh(&self) -> RuleUpdateSummary {
        let mut summary = RuleUpdateSummary::default();

        for source in &self.sources {
            let result = match self.fetch(&source.url).await {
                Ok(body) => install_if_changed(&source.dest, &body),
                Err(e) => Err(e),
            };

            match result {
                Ok(true) => {
                    info!(dest = %source.dest.display(), "Rule list updated");
                    summary.updated.push(source.dest.clone());
                }
                Ok(false) => {
                    debug!(dest = %source.dest.display(), "Rule list unchanged");
                    summary.unchanged.push(source.dest.clone());
                }
                Err(e) => {
                    warn!(url = %source.url, "Rule download skipped: {}", e);
                    summary.failed.push((source.url.clone(), e.to_string()));
                }
            }
        }

        if !summary.updated.is_empty() {
            if summary.updated.iter().all(|dest| self.is_watched(dest)) {
                debug!("Updated lists are watched, restart follows from the watcher");
            } else {
                self.restart.request();
            }
            summary.restart_requested = true;
        }

        summary
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let download_error = |reason: String| DnsvisorError::DownloadError {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(download_error(format!("HTTP {}", status.as_u16())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| download_error(e.to_string()))?;

        if body.len() < self.min_bytes {
            return Err(download_error(format!(
                "body of {} bytes is below the {} byte minimum",
                body.len(),
                self.min_bytes
            )));
        }

        Ok(body.to_vec())
    }
}

#[async_trait]
impl MaintenanceTask for RuleUpdater {
    fn name(&self) -> &str {
        "rule-update"
    }

    async fn run(&self) -> Result<()> {
        let summary = self.refresh().await;
        info!(
            updated = summary.updated.len(),
            unchanged = summary.unchanged.len(),
            failed = summary.failed.len(),
            "Rule refresh finished"
        );

        if summary.updated.is_empty() && !summary.failed.is_empty() && summary.unchanged.is_empty() {
            return Err(DnsvisorError::Other(format!(
                "All {} rule downloads failed",
                summary.failed.len()
            )));
        }
        Ok(())
    }
}

/// Replace `dest` with `content` unless it already holds exactly that
///
/// Returns whether the file was written. The write goes through a temp file
/// and a rename so the resolver never loads a half-written list.
pub fn install_if_changed(dest: &Path, content: &[u8]) -> Result<bool> {
    if let Ok(current) = fs::read(dest) {
        if current == content {
            return Ok(false);
        }
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = dest.with_extension("download");
    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, dest).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        DnsvisorError::Io(e)
    })?;

    Ok(true)
}
