// File watcher - one restart per quiet burst of config or rule file writes

use crate::config::WatchConfig;
use crate::error::{DnsvisorError, Result};
use crate::process::RestartSignal;
use crate::shutdown::ShutdownSignal;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

pub struct FileWatchDebouncer {
    config_file: PathBuf,
    rules_dir: PathBuf,
    debounce: Duration,
    restart: RestartSignal,
}

impl FileWatchDebouncer {
    pub fn new(config: &WatchConfig, restart: RestartSignal) -> Self {
        Self {
            config_file: config.config_file.clone(),
            rules_dir: config.rules_dir.clone(),
            debounce: config.debounce(),
            restart,
        }
    }

    /// Watch the configured paths until shutdown
    ///
    /// Paths that cannot be watched are logged and skipped. Only failing to
    /// create the watcher itself is an error.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            // The receiver is gone only after shutdown
            let _ = tx.send(event);
        })
        .map_err(|e| DnsvisorError::WatchError(format!("Failed to create watcher: {}", e)))?;

        // The config file is watched through its directory so replace-by-rename saves are seen
        if let Some(dir) = self.config_file.parent() {
            watch_path(&mut watcher, dir, RecursiveMode::NonRecursive);
        }
        watch_path(&mut watcher, &self.rules_dir, RecursiveMode::Recursive);

        info!(
            config = %self.config_file.display(),
            rules = %self.rules_dir.display(),
            "Watching resolver files"
        );

        self.run_with_events(rx, shutdown).await;

        drop(watcher);
        debug!("File watcher closed");
        Ok(())
    }

    /// Debounce loop over an already established event stream
    pub async fn run_with_events(
        &self,
        mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
        shutdown: ShutdownSignal,
    ) {
        let mut deadline: Option<Instant> = None;
        let mut closed = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = events.recv(), if !closed => match event {
                    Some(Ok(event)) => {
                        if is_qualifying(&event.kind) && self.is_relevant(&event) {
                            debug!(paths = ?event.paths, "Resolver file changed");
                            deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                    Some(Err(e)) => warn!("File watcher error: {}", e),
                    None => closed = true,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    if self.restart.request() {
                        info!("Resolver files settled, requesting restart");
                    } else {
                        debug!("Restart already pending");
                    }
                }
            }
        }
    }

    fn is_relevant(&self, event: &Event) -> bool {
        event
            .paths
            .iter()
            .any(|path| path == &self.config_file || path.starts_with(&self.rules_dir))
    }
}

/// Writes, creates and renames into place count; metadata, access and removals do not
pub fn is_qualifying(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Other) => true,
        EventKind::Modify(ModifyKind::Name(mode)) => {
            matches!(mode, RenameMode::To | RenameMode::Both | RenameMode::Any)
        }
        _ => false,
    }
}

fn watch_path(watcher: &mut RecommendedWatcher, path: &Path, mode: RecursiveMode) {
    if let Err(e) = watcher.watch(path, mode) {
        warn!(path = %path.display(), "Cannot watch path: {}", e);
    }
}
