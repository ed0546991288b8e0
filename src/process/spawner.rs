use crate::config::{ResolverConfig, StdioTarget};
use crate::error::{DnsvisorError, Result};
use crate::process::types::ChildHandle;
use std::fs::OpenOptions;
use std::process::Stdio;
use tokio::process::Command;

/// Launch the resolver as described by `config`
///
/// The child is started with the fixed argument vector, the optional
/// working directory and the configured stdout/stderr targets. A bare binary
/// name is looked up in `PATH`. The child is not killed when the handle is
/// dropped; shutting it down is the supervisor's job.
pub fn spawn_resolver(config: &ResolverConfig, generation: u64) -> Result<ChildHandle> {
    let mut command = Command::new(&config.binary);
    command.args(&config.args);

    if let Some(ref dir) = config.working_dir {
        command.current_dir(dir);
    }

    command.stdin(Stdio::null());
    command.stdout(open_target(&config.stdout)?);
    command.stderr(open_target(&config.stderr)?);
    command.kill_on_drop(false);

    let child = command.spawn().map_err(|e| {
        DnsvisorError::SpawnError(format!(
            "Failed to spawn '{}': {}",
            config.binary.display(),
            e
        ))
    })?;

    let pid = child.id().ok_or_else(|| {
        DnsvisorError::SpawnError(format!(
            "Failed to get PID for '{}'",
            config.binary.display()
        ))
    })?;

    Ok(ChildHandle::new(child, pid, generation))
}

fn open_target(target: &StdioTarget) -> Result<Stdio> {
    match target {
        StdioTarget::Inherit => Ok(Stdio::inherit()),
        StdioTarget::Null => Ok(Stdio::null()),
        StdioTarget::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    DnsvisorError::SpawnError(format!(
                        "Failed to open output file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            Ok(Stdio::from(file))
        }
    }
}
