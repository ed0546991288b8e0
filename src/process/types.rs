use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tokio::process::Child;

/// Lifecycle of the supervised resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Stopping => write!(f, "stopping"),
            SupervisorState::Terminated => write!(f, "terminated"),
        }
    }
}

/// The one live resolver child, owned by the supervisor
///
/// A new handle is created for every launch and dropped once its exit has
/// been observed.
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
    pid: u32,
    generation: u64,
    started_at: SystemTime,
    alive: bool,
    /// Whether this child's counters were already folded into the stats record
    carried: bool,
}

impl ChildHandle {
    pub fn new(child: Child, pid: u32, generation: u64) -> Self {
        Self {
            child,
            pid,
            generation,
            started_at: SystemTime::now(),
            alive: true,
            carried: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or(Duration::from_secs(0))
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn mark_exited(&mut self) {
        self.alive = false;
    }

    pub fn is_carried(&self) -> bool {
        self.carried
    }

    pub fn mark_carried(&mut self) {
        self.carried = true;
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

/// Read-only view of the supervisor published to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    /// Number of relaunches after the first successful start
    pub restarts: u64,
    pub last_exit: Option<String>,
}

impl SupervisorStatus {
    pub fn new() -> Self {
        Self {
            state: SupervisorState::Starting,
            pid: None,
            started_at: None,
            restarts: 0,
            last_exit: None,
        }
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.started_at
            .map(|t| SystemTime::now().duration_since(t).unwrap_or_default())
    }
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self::new()
    }
}
