// PID file guarding against a second agent

use crate::error::{DnsvisorError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Records the agent's PID so only one agent supervises the resolver
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Claim the PID file for this process
    ///
    /// Fails with [`DnsvisorError::AgentAlreadyRunning`] when the recorded
    /// process is still alive. A stale file is replaced.
    pub fn acquire(&self) -> Result<()> {
        if let Some(pid) = self.running_pid() {
            if pid != std::process::id() {
                return Err(DnsvisorError::AgentAlreadyRunning(pid));
            }
        } else if self.exists() {
            warn!(path = %self.path.display(), "Replacing stale PID file");
        }

        self.write()
    }

    /// Write the current process PID to the file
    pub fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pid = std::process::id();
        fs::write(&self.path, pid.to_string())
            .map_err(|e| DnsvisorError::PidFileError(format!("Failed to write PID file: {}", e)))
    }

    /// Read the PID from the file
    pub fn read(&self) -> Result<u32> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| DnsvisorError::PidFileError(format!("Failed to read PID file: {}", e)))?;

        content
            .trim()
            .parse::<u32>()
            .map_err(|e| DnsvisorError::PidFileError(format!("Invalid PID in file: {}", e)))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Remove the PID file if it still names this process
    pub fn release(&self) -> Result<()> {
        match self.read() {
            Ok(pid) if pid == std::process::id() => fs::remove_file(&self.path).map_err(|e| {
                DnsvisorError::PidFileError(format!("Failed to remove PID file: {}", e))
            }),
            _ => Ok(()),
        }
    }

    /// PID of a live agent recorded in the file
    pub fn running_pid(&self) -> Option<u32> {
        let pid = self.read().ok()?;
        is_process_alive(pid).then_some(pid)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    // Signal 0 only checks for existence
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pid_file(dir: &TempDir) -> PidFile {
        PidFile::with_path(dir.path().join("run/agent.pid"))
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let pid_file = pid_file(&dir);

        pid_file.acquire().unwrap();
        assert_eq!(pid_file.read().unwrap(), std::process::id());
        assert_eq!(pid_file.running_pid(), Some(std::process::id()));

        // Re-acquiring from the same process is fine
        pid_file.acquire().unwrap();

        pid_file.release().unwrap();
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_live_foreign_pid_is_refused() {
        let dir = TempDir::new().unwrap();
        let pid_file = pid_file(&dir);

        let mut child = std::process::Command::new("/bin/sleep")
            .arg("5")
            .spawn()
            .unwrap();
        fs::create_dir_all(pid_file.path().parent().unwrap()).unwrap();
        fs::write(pid_file.path(), child.id().to_string()).unwrap();

        match pid_file.acquire() {
            Err(DnsvisorError::AgentAlreadyRunning(pid)) => assert_eq!(pid, child.id()),
            other => panic!("expected AgentAlreadyRunning, got {:?}", other),
        }

        // Someone else's file is left alone
        pid_file.release().unwrap();
        assert!(pid_file.exists());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_stale_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let pid_file = pid_file(&dir);

        let mut child = std::process::Command::new("/bin/true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        fs::create_dir_all(pid_file.path().parent().unwrap()).unwrap();
        fs::write(pid_file.path(), dead_pid.to_string()).unwrap();

        pid_file.acquire().unwrap();
        assert_eq!(pid_file.read().unwrap(), std::process::id());
    }

    #[test]
    fn test_garbage_content() {
        let dir = TempDir::new().unwrap();
        let pid_file = pid_file(&dir);
        fs::create_dir_all(pid_file.path().parent().unwrap()).unwrap();
        fs::write(pid_file.path(), "not-a-pid").unwrap();

        assert!(pid_file.running_pid().is_none());
        assert!(pid_file.acquire().is_ok());
    }
}
