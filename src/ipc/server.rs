// IPC Server - Accepts CLI connections on the agent's Unix socket

use crate::error::{DnsvisorError, Result};
use crate::ipc::{Command, Request, Response, ResponseData};
use crate::shutdown::ShutdownSignal;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// IPC server bound to the control socket
pub struct IpcServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl IpcServer {
    /// Bind the socket, replacing a stale one, with owner-only permissions
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self> {
        let socket_path = path.as_ref().to_path_buf();

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                DnsvisorError::IpcError(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| DnsvisorError::IpcError(format!("Failed to bind to socket: {}", e)))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&socket_path, permissions).map_err(|e| {
                DnsvisorError::IpcError(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        Ok(Self {
            socket_path,
            listener,
        })
    }

    /// Serve connections until shutdown, one task per connection
    pub async fn run<F, Fut>(&self, handler: F, shutdown: ShutdownSignal)
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseData>> + Send,
    {
        let handler = Arc::new(handler);

        loop {
            let stream = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown.cancelled() => return,
            };

            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = Self::serve(stream, handler.as_ref()).await {
                    debug!("Control connection failed: {}", e);
                }
            });
        }
    }

    async fn serve<F, Fut>(stream: UnixStream, handler: &F) -> Result<()>
    where
        F: Fn(Command) -> Fut,
        Fut: Future<Output = Result<ResponseData>>,
    {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut request_line = String::new();
        reader
            .read_line(&mut request_line)
            .await
            .map_err(|e| DnsvisorError::IpcError(format!("Failed to read request: {}", e)))?;

        let response = match serde_json::from_str::<Request>(&request_line) {
            Ok(request) => {
                debug!(id = request.id, command = ?request.command, "Control request");
                match handler(request.command).await {
                    Ok(data) => Response::success(request.id, data),
                    Err(e) => Response::error(request.id, e.to_string()),
                }
            }
            Err(e) => Response::error(0, format!("Malformed request: {}", e)),
        };

        let mut response_json = serde_json::to_string(&response).map_err(|e| {
            DnsvisorError::SerializationError(format!("Failed to serialize response: {}", e))
        })?;
        response_json.push('\n');

        writer
            .write_all(response_json.as_bytes())
            .await
            .map_err(|e| DnsvisorError::IpcError(format!("Failed to write response: {}", e)))?;

        writer
            .flush()
            .await
            .map_err(|e| DnsvisorError::IpcError(format!("Failed to flush stream: {}", e)))?;

        Ok(())
    }

    /// Get the socket path being used
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        // Clean up socket file on drop
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bind_sets_owner_only_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.sock");

        let server = IpcServer::bind(&path).unwrap();
        let mode = std::fs::metadata(server.socket_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_and_drop_cleans_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.sock");
        std::fs::write(&path, b"stale").unwrap();

        {
            let _server = IpcServer::bind(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_response() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.sock");
        let server = IpcServer::bind(&path).unwrap();
        let shutdown = ShutdownSignal::new();

        let serve_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            server
                .run(
                    |_command| async { Ok(ResponseData::Success("ok".to_string())) },
                    serve_shutdown,
                )
                .await
        });

        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"not json\n").await.unwrap();

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        assert!(response.result.unwrap_err().starts_with("Malformed request"));

        shutdown.trigger();
        task.await.unwrap();
    }
}
