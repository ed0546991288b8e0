// IPC Client - Talks to the agent over its Unix socket

use crate::error::{DnsvisorError, Result};
use crate::ipc::{Command, Request, Response, ResponseData};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Maximum number of connection retry attempts
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Rule refreshes download several lists before answering
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// IPC client for the operator CLI
pub struct IpcClient {
    socket_path: PathBuf,
    request_id: AtomicU64,
}

impl IpcClient {
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            request_id: AtomicU64::new(1),
        }
    }

    /// Send a command and return the agent's answer, failures included
    pub fn send_command(&self, command: Command) -> Result<Response> {
        let request_id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(request_id, command);

        let mut last_error = None;
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            match self.try_send_request(&request) {
                Ok(response) => {
                    if response.id != request_id {
                        return Err(DnsvisorError::ProtocolError(format!(
                            "Response ID mismatch: expected {}, got {}",
                            request_id, response.id
                        )));
                    }
                    return Ok(response);
                }
                // Nothing listening: retrying cannot help
                Err(DnsvisorError::AgentNotRunning) => return Err(DnsvisorError::AgentNotRunning),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRY_ATTEMPTS {
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DnsvisorError::ConnectionError("Failed to connect after retries".to_string())
        }))
    }

    /// Like [`IpcClient::send_command`] but turns an agent-side error into `Err`
    pub fn request(&self, command: Command) -> Result<ResponseData> {
        self.send_command(command)?
            .result
            .map_err(DnsvisorError::CommandRejected)
    }

    fn try_send_request(&self, request: &Request) -> Result<Response> {
        let mut stream = self.connect()?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        let request_json = serde_json::to_string(request).map_err(|e| {
            DnsvisorError::SerializationError(format!("Failed to serialize request: {}", e))
        })?;

        writeln!(stream, "{}", request_json)
            .map_err(|e| DnsvisorError::IpcError(format!("Failed to write request: {}", e)))?;

        stream
            .flush()
            .map_err(|e| DnsvisorError::IpcError(format!("Failed to flush stream: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .map_err(|e| DnsvisorError::IpcError(format!("Failed to read response: {}", e)))?;

        serde_json::from_str(&response_line).map_err(|e| {
            DnsvisorError::DeserializationError(format!("Failed to deserialize response: {}", e))
        })
    }

    fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(DnsvisorError::AgentNotRunning);
        }

        UnixStream::connect(&self.socket_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound
            {
                DnsvisorError::AgentNotRunning
            } else {
                DnsvisorError::ConnectionError(format!("Failed to connect to agent: {}", e))
            }
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}
