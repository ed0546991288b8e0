// Logging - tracing subscriber setup shared by the agent and the CLI

use tracing_subscriber::EnvFilter;

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` (for example the
/// agent's configured `log_level`) is used. Calling this twice is harmless:
/// the second install attempt is ignored.
pub fn init(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
