use thiserror::Error;

/// Main error type for the dnsvisor agent and CLI
#[derive(Debug, Error)]
pub enum DnsvisorError {
    // Child process errors
    #[error("Failed to spawn resolver: {0}")]
    SpawnError(String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // Metrics and stats errors
    #[error("Metrics endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Metrics endpoint returned HTTP {0}")]
    MetricsStatus(u16),

    #[error("Failed to save stats: {0}")]
    StatsSaveError(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // File watching
    #[error("File watcher error: {0}")]
    WatchError(String),

    // Privileged command surface
    #[error("Command `{command}` failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("Required tool not found: {0}")]
    ToolMissing(String),

    // Scheduled maintenance
    #[error("Rule download failed for {url}: {reason}")]
    DownloadError { url: String, reason: String },

    // IPC errors
    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Failed to connect to agent: {0}")]
    ConnectionError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    #[error("Agent not running")]
    AgentNotRunning,

    #[error("Agent already running (PID {0})")]
    AgentAlreadyRunning(u32),

    #[error("Agent rejected the command: {0}")]
    CommandRejected(String),

    #[error("PID file error: {0}")]
    PidFileError(String),

    #[error("Log error: {0}")]
    LogError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("{0}")]
    Other(String),
}

impl DnsvisorError {
    /// Whether this error belongs to the tolerated class: the resolver is not
    /// up yet (or already gone), or a privileged tool is absent on this host.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DnsvisorError::Unreachable(_) | DnsvisorError::ToolMissing(_)
        )
    }
}

/// Result type alias for dnsvisor operations
pub type Result<T> = std::result::Result<T, DnsvisorError>;
