// Logs module - Access to the resolver's own log file

use crate::error::{DnsvisorError, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// The log file the resolver writes
#[derive(Debug, Clone)]
pub struct ResolverLog {
    path: PathBuf,
}

impl ResolverLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last `lines` lines, optionally only those containing `filter`
    ///
    /// A missing file reads as empty.
    pub async fn tail(&self, lines: usize, filter: Option<&str>) -> Result<Vec<String>> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(DnsvisorError::LogError(format!(
                    "Failed to open {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let mut window = VecDeque::with_capacity(lines.min(4096));
        let mut reader = BufReader::new(file).lines();

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|e| DnsvisorError::LogError(format!("Failed to read log line: {}", e)))?
        {
            if let Some(pattern) = filter {
                if !line.contains(pattern) {
                    continue;
                }
            }

            if window.len() == lines {
                window.pop_front();
            }
            if lines > 0 {
                window.push_back(line);
            }
        }

        Ok(window.into())
    }

    /// Current size in bytes, `0` when the file does not exist
    pub async fn size(&self) -> u64 {
        tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Empty the file in place so the resolver keeps its open descriptor
    pub async fn truncate(&self) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                DnsvisorError::LogError(format!("Failed to open {}: {}", self.path.display(), e))
            })?;

        file.set_len(0)
            .await
            .map_err(|e| DnsvisorError::LogError(format!("Failed to truncate log: {}", e)))?;

        info!(path = %self.path.display(), "Resolver log cleared");
        Ok(())
    }
}
