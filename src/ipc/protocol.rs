// IPC Protocol definitions for CLI-agent communication

use crate::check::LookupResult;
use crate::process::SupervisorState;
use crate::schedule::RuleUpdateSummary;
use crate::stats::StatsReport;
use serde::{Deserialize, Serialize};

/// Commands the agent accepts on its control socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Status,
    Restart,
    /// Drop the resolver cache and the carried stats, then restart
    Flush,
    Stats,
    UpdateRules,
    /// Resolve the configured domains through the local resolver
    CheckResolution,
    Logs {
        lines: usize,
        filter: Option<String>,
    },
    ClearLogs,
    Shutdown,
}

/// Supervisor view returned by `Status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverStatus {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub uptime_secs: u64,
    pub restarts: u64,
    pub last_exit: Option<String>,
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
    pub log_bytes: u64,
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    Status(ResolverStatus),
    /// `already_pending` when the request merged into one not yet served
    RestartRequested { already_pending: bool },
    Flushed { dump_removed: bool },
    Stats(StatsReport),
    RulesUpdated(RuleUpdateSummary),
    Resolution(Vec<LookupResult>),
    Logs(Vec<String>),
    /// Generic success message
    Success(String),
}

/// Request message from client to agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from agent to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, String>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: String) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = Request::new(
            7,
            Command::Logs {
                lines: 20,
                filter: Some("error".to_string()),
            },
        );
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"id":7,"command":{"Logs":{"lines":20,"filter":"error"}}}"#
        );

        let unit = serde_json::to_string(&Request::new(1, Command::Flush)).unwrap();
        assert_eq!(unit, r#"{"id":1,"command":"Flush"}"#);
    }

    #[test]
    fn test_error_response_wire_format() {
        let response = Response::error(3, "Agent is shutting down".to_string());
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"id":3,"result":{"Err":"Agent is shutting down"}}"#);
    }
}
