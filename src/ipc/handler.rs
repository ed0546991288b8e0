// Agent-side dispatch of control commands

use crate::check::ResolutionCheck;
use crate::error::{DnsvisorError, Result};
use crate::ipc::{Command, ResolverStatus, ResponseData};
use crate::logs::ResolverLog;
use crate::process::{ChildMonitor, RestartSignal, SupervisorStatus};
use crate::process::supervisor::uptime_secs;
use crate::schedule::RuleUpdater;
use crate::shutdown::ShutdownSignal;
use crate::stats::{StatsReport, StatsStore};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::info;

/// Serves control commands from shared handles only
///
/// The handler never touches the resolver process: restarts go through the
/// [`RestartSignal`] and status comes from the supervisor's published view.
pub struct ControlHandler {
    restart: RestartSignal,
    stats: Arc<StatsStore>,
    status: watch::Receiver<SupervisorStatus>,
    rules: Arc<RuleUpdater>,
    check: Arc<ResolutionCheck>,
    log: ResolverLog,
    cache_dump: PathBuf,
    shutdown: ShutdownSignal,
    monitor: Mutex<ChildMonitor>,
}

impl ControlHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        restart: RestartSignal,
        stats: Arc<StatsStore>,
        status: watch::Receiver<SupervisorStatus>,
        rules: Arc<RuleUpdater>,
        check: Arc<ResolutionCheck>,
        log: ResolverLog,
        cache_dump: PathBuf,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            restart,
            stats,
            status,
            rules,
            check,
            log,
            cache_dump,
            shutdown,
            monitor: Mutex::new(ChildMonitor::new()),
        }
    }

    pub async fn handle(&self, command: Command) -> Result<ResponseData> {
        match command {
            Command::Status => Ok(ResponseData::Status(self.status().await)),
            Command::Restart => {
                let filled = self.restart.request();
                info!("Restart requested over control socket");
                Ok(ResponseData::RestartRequested {
                    already_pending: !filled,
                })
            }
            Command::Flush => self.flush().await,
            Command::Stats => Ok(ResponseData::Stats(StatsReport::new(
                self.stats.total().await,
            ))),
            Command::UpdateRules => Ok(ResponseData::RulesUpdated(self.rules.refresh().await)),
            Command::CheckResolution => {
                let results = Arc::clone(&self.check).run_blocking().await?;
                Ok(ResponseData::Resolution(results))
            }
            Command::Logs { lines, filter } => {
                let lines = self.log.tail(lines, filter.as_deref()).await?;
                Ok(ResponseData::Logs(lines))
            }
            Command::ClearLogs => {
                self.log.truncate().await?;
                Ok(ResponseData::Success("Resolver log cleared".to_string()))
            }
            Command::Shutdown => {
                info!("Shutdown requested over control socket");
                self.shutdown.trigger();
                Ok(ResponseData::Success("Agent shutting down".to_string()))
            }
        }
    }

    async fn status(&self) -> ResolverStatus {
        let current = self.status.borrow().clone();

        let usage = current.pid.and_then(|pid| {
            self.monitor
                .lock()
                .ok()
                .and_then(|mut monitor| monitor.sample(pid))
        });

        ResolverStatus {
            state: current.state,
            pid: current.pid,
            uptime_secs: uptime_secs(current.started_at),
            restarts: current.restarts,
            last_exit: current.last_exit,
            memory_bytes: usage.map(|u| u.memory_bytes),
            cpu_percent: usage.map(|u| u.cpu_percent),
            log_bytes: self.log.size().await,
        }
    }

    /// Remove the cache dump and the carried stats, then restart the resolver
    async fn flush(&self) -> Result<ResponseData> {
        let dump_removed = match tokio::fs::remove_file(&self.cache_dump).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(DnsvisorError::Other(format!(
                    "Failed to remove cache dump {}: {}",
                    self.cache_dump.display(),
                    e
                )))
            }
        };

        self.stats.clear().await?;
        self.restart.request();

        info!(dump_removed, "Cache flushed");
        Ok(ResponseData::Flushed { dump_removed })
    }
}
