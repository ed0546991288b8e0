use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Resource usage of the resolver child at one instant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChildUsage {
    /// Resident memory in bytes
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// Samples resource usage of a single pid
pub struct ChildMonitor {
    system: System,
}

impl ChildMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Sample the given pid, or `None` when it no longer exists
    pub fn sample(&mut self, pid: u32) -> Option<ChildUsage> {
        let sys_pid = Pid::from_u32(pid);

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_memory().with_cpu(),
        );

        self.system.process(sys_pid).map(|process| ChildUsage {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        })
    }
}

impl Default for ChildMonitor {
    fn default() -> Self {
        Self::new()
    }
}
