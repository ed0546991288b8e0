use crate::config::ResolverConfig;
use crate::shutdown::ShutdownSignal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Single-slot coalescing restart request
///
/// Any number of producers call [`RestartSignal::request`]; exactly one
/// consumer (the supervisor) calls [`RestartSignal::wait`]. Requests that
/// arrive while one is already pending collapse into it.
#[derive(Debug, Clone, Default)]
pub struct RestartSignal {
    inner: Arc<SignalSlot>,
}

#[derive(Debug, Default)]
struct SignalSlot {
    pending: AtomicBool,
    notify: Notify,
}

impl RestartSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a restart as pending. Never blocks.
    ///
    /// Returns `true` if this call filled the slot, `false` if a request was
    /// already pending.
    pub fn request(&self) -> bool {
        if self.inner.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Stores a permit when the consumer is not parked yet
        self.inner.notify.notify_one();
        true
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Wait for a pending request and consume it
    ///
    /// Returns `true` when a request was consumed, `false` when shutdown was
    /// triggered first.
    pub async fn wait(&self, shutdown: &ShutdownSignal) -> bool {
        loop {
            if shutdown.is_triggered() {
                return false;
            }
            if self.inner.pending.swap(false, Ordering::AcqRel) {
                return true;
            }

            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = shutdown.cancelled() => return false,
            }
        }
    }
}

/// Fixed pacing for the supervisor's relaunch paths
///
/// Launch failures are retried forever with the same delay; there is no
/// exponential growth and no retry limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartDelays {
    /// Wait after a failed launch before trying again
    pub launch_retry: Duration,
    /// Pause after the child exited before relaunching it
    pub crash_pause: Duration,
    /// Bound on waiting for the child after the shutdown SIGTERM
    pub stop_timeout: Duration,
}

impl RestartDelays {
    pub fn from_config(config: &ResolverConfig) -> Self {
        Self {
            launch_retry: config.launch_retry(),
            crash_pause: config.crash_pause(),
            stop_timeout: config.stop_timeout(),
        }
    }
}

impl Default for RestartDelays {
    fn default() -> Self {
        Self::from_config(&ResolverConfig::default())
    }
}
