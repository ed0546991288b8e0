use crate::config::ResolverConfig;
use crate::error::{DnsvisorError, Result};
use crate::process::restart::{RestartDelays, RestartSignal};
use crate::process::spawner::spawn_resolver;
use crate::process::types::{ChildHandle, SupervisorState, SupervisorStatus};
use crate::shutdown::ShutdownSignal;
use crate::stats::StatsStore;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// What woke the supervisor while a child was running
enum Wakeup {
    Exited(std::io::Result<ExitStatus>),
    Restart,
    Shutdown,
}

/// Keeps exactly one resolver child alive
///
/// The supervisor is the only owner of the child handle. Every other task
/// asks for a restart through the shared [`RestartSignal`]; nothing else
/// ever signals the OS process. Counters are carried into the
/// [`StatsStore`] before any termination the supervisor causes, and at most
/// once per child.
pub struct ProcessSupervisor {
    config: ResolverConfig,
    delays: RestartDelays,
    stats: Arc<StatsStore>,
    restart: RestartSignal,
    status: watch::Sender<SupervisorStatus>,
    generation: u64,
}

impl ProcessSupervisor {
    pub fn new(config: ResolverConfig, stats: Arc<StatsStore>, restart: RestartSignal) -> Self {
        let delays = RestartDelays::from_config(&config);
        let (status, _) = watch::channel(SupervisorStatus::new());

        Self {
            config,
            delays,
            stats,
            restart,
            status,
            generation: 0,
        }
    }

    /// Override the relaunch pacing taken from the config
    pub fn with_delays(mut self, delays: RestartDelays) -> Self {
        self.delays = delays;
        self
    }

    /// Ask for a restart. Never blocks; duplicates collapse into one.
    pub fn request_restart(&self) -> bool {
        self.restart.request()
    }

    pub fn restart_signal(&self) -> RestartSignal {
        self.restart.clone()
    }

    /// Observe status changes without touching the child
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    /// Supervise until `shutdown` is triggered
    ///
    /// On shutdown the current child gets one SIGTERM and a bounded wait;
    /// it is never relaunched afterwards.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        info!(binary = %self.config.binary.display(), "Starting resolver supervisor");

        loop {
            let Some(mut handle) = self.launch(&shutdown).await else {
                break;
            };

            let mut kill_sent = false;

            let exit = loop {
                let wakeup = tokio::select! {
                    status = handle.child_mut().wait() => Wakeup::Exited(status),
                    requested = self.restart.wait(&shutdown), if !kill_sent => {
                        if requested { Wakeup::Restart } else { Wakeup::Shutdown }
                    }
                    _ = shutdown.cancelled() => Wakeup::Shutdown,
                };

                match wakeup {
                    Wakeup::Exited(Ok(status)) => break Ok(status),
                    Wakeup::Exited(Err(e)) => {
                        // The child may still be running; never relaunch next to it
                        warn!(pid = handle.pid(), "Failed to wait for resolver, killing it: {}", e);
                        self.carry_once(&mut handle).await;
                        break reap(handle.child_mut(), self.delays.stop_timeout).await;
                    }
                    Wakeup::Restart => {
                        info!(pid = handle.pid(), "Restart requested, replacing resolver");
                        self.carry_once(&mut handle).await;
                        if let Err(e) = handle.child_mut().start_kill() {
                            debug!(pid = handle.pid(), "Kill failed, child is already gone: {}", e);
                        }
                        kill_sent = true;
                    }
                    Wakeup::Shutdown => {
                        self.stop(handle).await;
                        self.set_state(SupervisorState::Terminated);
                        info!("Resolver supervisor stopped");
                        return;
                    }
                }
            };

            handle.mark_exited();
            let description = describe_exit(&exit);

            if kill_sent {
                info!(pid = handle.pid(), "Resolver terminated for restart");
            } else {
                warn!(pid = handle.pid(), "Resolver exited unexpectedly: {}", description);
            }

            // A child that died on its own usually has no endpoint left; carrying is best effort
            self.carry_once(&mut handle).await;
            self.stats.set_live_generation(None);

            self.status.send_modify(|status| {
                status.state = SupervisorState::Starting;
                status.pid = None;
                status.started_at = None;
                status.last_exit = Some(description);
            });

            if !kill_sent && !self.pause(self.delays.crash_pause, &shutdown).await {
                break;
            }
        }

        self.set_state(SupervisorState::Terminated);
        info!("Resolver supervisor stopped");
    }

    /// Start a child, retrying forever until it launches or shutdown begins
    async fn launch(&mut self, shutdown: &ShutdownSignal) -> Option<ChildHandle> {
        loop {
            if shutdown.is_triggered() {
                return None;
            }

            self.generation += 1;

            match spawn_resolver(&self.config, self.generation) {
                Ok(handle) => {
                    let first = self.generation == 1;
                    info!(
                        pid = handle.pid(),
                        generation = handle.generation(),
                        "Resolver started"
                    );

                    self.stats.set_live_generation(Some(handle.generation()));
                    self.status.send_modify(|status| {
                        status.state = SupervisorState::Running;
                        status.pid = Some(handle.pid());
                        status.started_at = Some(handle.started_at());
                        if !first {
                            status.restarts += 1;
                        }
                    });

                    return Some(handle);
                }
                Err(e) => {
                    // Failed launches do not count as generations that ran
                    self.generation -= 1;
                    error!(
                        "Failed to launch resolver, retrying in {:?}: {}",
                        self.delays.launch_retry, e
                    );
                    self.set_state(SupervisorState::Starting);

                    if !self.pause(self.delays.launch_retry, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// One graceful termination attempt with a bounded wait
    async fn stop(&mut self, mut handle: ChildHandle) {
        self.set_state(SupervisorState::Stopping);
        self.carry_once(&mut handle).await;

        let pid = handle.pid();
        if let Err(e) = send_sigterm(pid) {
            warn!(pid, "Failed to signal resolver: {}", e);
            return;
        }

        match tokio::time::timeout(self.delays.stop_timeout, handle.child_mut().wait()).await {
            Ok(Ok(status)) => {
                handle.mark_exited();
                info!(pid, "Resolver stopped: {}", describe_exit(&Ok(status)));
            }
            Ok(Err(e)) => warn!(pid, "Failed to wait for resolver: {}", e),
            Err(_) => warn!(
                pid,
                "Resolver did not exit within {:?}, leaving it behind", self.delays.stop_timeout
            ),
        }

        self.stats.set_live_generation(None);
        self.status.send_modify(|status| {
            status.pid = None;
            status.started_at = None;
        });
    }

    async fn carry_once(&self, handle: &mut ChildHandle) {
        if handle.is_carried() {
            return;
        }
        handle.mark_carried();

        match self.stats.carry().await {
            Ok(true) => debug!(generation = handle.generation(), "Counters carried"),
            Ok(false) => {}
            Err(e) => warn!("Failed to carry resolver counters: {}", e),
        }
    }

    /// Sleep unless shutdown comes first; `false` means shutdown
    async fn pause(&self, duration: Duration, shutdown: &ShutdownSignal) -> bool {
        tokio::select! {
            _ = sleep(duration) => true,
            _ = shutdown.cancelled() => false,
        }
    }

    fn set_state(&self, state: SupervisorState) {
        self.status.send_modify(|status| status.state = state);
    }
}

/// Kill the child and wait for it, bounded by `timeout`
///
/// Used when waiting on the child failed and its state is unknown. An error
/// is returned only if the process could not be confirmed gone.
async fn reap(child: &mut Child, timeout: Duration) -> std::io::Result<ExitStatus> {
    if let Err(e) = child.start_kill() {
        debug!("Kill failed, child is already gone: {}", e);
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("child did not exit within {:?} of SIGKILL", timeout),
        )),
    }
}

fn describe_exit(status: &std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match status.code() {
            Some(code) => format!("exit code {}", code),
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        return format!("killed by signal {}", signal);
                    }
                }
                "terminated".to_string()
            }
        },
        Err(e) => format!("wait failed: {}", e),
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| DnsvisorError::SignalError(format!("SIGTERM to {}: {}", pid, e)))
}

#[cfg(not(unix))]
fn send_sigterm(pid: u32) -> Result<()> {
    Err(DnsvisorError::SignalError(format!(
        "Graceful termination of {} is not supported on this platform",
        pid
    )))
}

/// Seconds since the child started, for display
pub fn uptime_secs(started_at: Option<SystemTime>) -> u64 {
    started_at
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{CacheCounters, MetricsSource};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Unreachable;

    #[async_trait]
    impl MetricsSource for Unreachable {
        async fn snapshot(&self) -> Result<CacheCounters> {
            Err(DnsvisorError::Unreachable("test".to_string()))
        }
    }

    fn shell_config(script: &str) -> ResolverConfig {
        ResolverConfig {
            binary: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            ..ResolverConfig::default()
        }
    }

    fn fast_delays() -> RestartDelays {
        RestartDelays {
            launch_retry: Duration::from_millis(50),
            crash_pause: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn supervisor(config: ResolverConfig, dir: &TempDir) -> ProcessSupervisor {
        let stats = Arc::new(StatsStore::new(
            dir.path().join("stats.json"),
            Arc::new(Unreachable),
        ));
        ProcessSupervisor::new(config, stats, RestartSignal::new()).with_delays(fast_delays())
    }

    async fn wait_for_status<F>(rx: &mut watch::Receiver<SupervisorStatus>, f: F) -> SupervisorStatus
    where
        F: FnMut(&SupervisorStatus) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(f))
            .await
            .expect("timed out waiting for supervisor status")
            .expect("supervisor status channel closed")
            .clone()
    }

    #[tokio::test]
    async fn test_crashing_child_is_relaunched() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(shell_config("sleep 0.1; exit 3"), &dir);
        let mut rx = supervisor.subscribe();
        let shutdown = ShutdownSignal::new();

        let task = tokio::spawn(supervisor.run(shutdown.clone()));

        let status = wait_for_status(&mut rx, |s| s.restarts >= 2).await;
        assert_eq!(status.last_exit.as_deref(), Some("exit code 3"));

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().state, SupervisorState::Terminated);
    }

    #[tokio::test]
    async fn test_restart_request_replaces_child() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(shell_config("sleep 30"), &dir);
        let mut rx = supervisor.subscribe();
        let restart = supervisor.restart_signal();
        let shutdown = ShutdownSignal::new();

        let task = tokio::spawn(supervisor.run(shutdown.clone()));

        let first = wait_for_status(&mut rx, |s| s.state == SupervisorState::Running).await;
        let first_pid = first.pid.unwrap();

        assert!(restart.request());

        let second = wait_for_status(&mut rx, |s| {
            s.state == SupervisorState::Running && s.restarts == 1
        })
        .await;
        assert_ne!(second.pid, Some(first_pid));
        assert!(second.last_exit.unwrap().contains("signal 9"));

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_sends_sigterm() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("terminated");
        let script = format!(
            "trap 'touch {}; exit 0' TERM; while true; do sleep 0.05; done",
            marker.display()
        );
        let supervisor = supervisor(shell_config(&script), &dir);
        let mut rx = supervisor.subscribe();
        let shutdown = ShutdownSignal::new();

        let task = tokio::spawn(supervisor.run(shutdown.clone()));
        wait_for_status(&mut rx, |s| s.state == SupervisorState::Running).await;

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert!(marker.exists());
        let status = rx.borrow().clone();
        assert_eq!(status.state, SupervisorState::Terminated);
        assert_eq!(status.restarts, 0);
        assert!(status.pid.is_none());
    }

    #[tokio::test]
    async fn test_launch_failure_retries_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let config = ResolverConfig {
            binary: PathBuf::from("/nonexistent/resolver"),
            ..ResolverConfig::default()
        };
        let supervisor = supervisor(config, &dir);
        let rx = supervisor.subscribe();
        let shutdown = ShutdownSignal::new();

        let task = tokio::spawn(supervisor.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());
        assert_eq!(rx.borrow().state, SupervisorState::Starting);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().state, SupervisorState::Terminated);
    }

    #[tokio::test]
    async fn test_reap_kills_running_child() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let mut child = tokio::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let status = reap(&mut child, Duration::from_secs(2)).await.unwrap();
        assert_eq!(describe_exit(&Ok(status)), "killed by signal 9");
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[tokio::test]
    async fn test_reap_after_exit_returns_status() {
        let mut child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "exit 4"])
            .spawn()
            .unwrap();
        child.wait().await.unwrap();

        let status = reap(&mut child, Duration::from_secs(2)).await.unwrap();
        assert_eq!(status.code(), Some(4));
    }

    #[test]
    fn test_describe_exit() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(describe_exit(&Ok(ExitStatus::from_raw(0))), "exit code 0");
        assert_eq!(describe_exit(&Ok(ExitStatus::from_raw(9))), "killed by signal 9");
    }
}
