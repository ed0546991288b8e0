// Process module - Resolver child lifecycle

pub mod monitor;
pub mod restart;
pub mod spawner;
pub mod supervisor;
pub mod types;

pub use monitor::{ChildMonitor, ChildUsage};
pub use restart::{RestartDelays, RestartSignal};
pub use spawner::spawn_resolver;
pub use supervisor::ProcessSupervisor;
pub use types::{ChildHandle, SupervisorState, SupervisorStatus};
