// CLI module - Operator command-line interface

mod output;

use crate::config::AgentConfig;
use crate::error::{DnsvisorError, Result};
use crate::ipc::{Command, IpcClient};
use crate::rescue::RescueCoordinator;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use output::{format_duration, format_memory, print_error};

/// dnsvisor - keeps the DNS resolver running and its cache stats intact
#[derive(Parser)]
#[command(name = "dnsvisor")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Agent configuration file (defaults to $DNSVISOR_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Control socket of the agent (overrides the configuration)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the supervised resolver
    Status,

    /// Restart the resolver, keeping its cache stats
    Restart,

    /// Delete the resolver cache and carried stats, then restart
    Flush,

    /// Show cumulative cache statistics
    Stats,

    /// Download the rule lists now
    Update,

    /// Resolve test domains through the local resolver
    #[command(alias = "check")]
    Test,

    /// Show or clear the resolver log
    Logs {
        /// Number of lines to display
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,

        /// Only lines containing this text
        #[arg(short, long)]
        filter: Option<String>,

        /// Truncate the log instead of showing it
        #[arg(long, conflicts_with_all = ["lines", "filter"])]
        clear: bool,
    },

    /// Stop the agent and the resolver
    Shutdown,

    /// DNS failover to the fallback resolver (runs locally)
    Rescue {
        #[command(subcommand)]
        action: RescueAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum RescueAction {
    /// Redirect DNS traffic to the fallback resolver
    Enable,
    /// Remove the redirect
    Disable,
    /// Report whether the redirect is installed
    Status,
}

impl Cli {
    /// Run the CLI application
    pub fn run() -> Result<()> {
        let cli = Cli::parse();
        crate::logging::init("warn");
        cli.execute()
    }

    fn execute(&self) -> Result<()> {
        let config = AgentConfig::load(self.config.as_deref())?;

        if let Commands::Rescue { action } = &self.command {
            return run_rescue(&config, *action);
        }

        let command = self.build_command()?;
        let socket = self
            .socket
            .clone()
            .unwrap_or_else(|| config.agent.socket_path.clone());

        let client = IpcClient::with_socket_path(socket);
        let response = client.send_command(command)?;

        match response.result {
            Ok(data) => {
                output::print_response(&data);
                Ok(())
            }
            Err(error_msg) => {
                output::print_error(&error_msg);
                Err(DnsvisorError::CommandRejected(error_msg))
            }
        }
    }

    /// Build an IPC command from the CLI arguments
    fn build_command(&self) -> Result<Command> {
        match &self.command {
            Commands::Status => Ok(Command::Status),
            Commands::Restart => Ok(Command::Restart),
            Commands::Flush => Ok(Command::Flush),
            Commands::Stats => Ok(Command::Stats),
            Commands::Update => Ok(Command::UpdateRules),
            Commands::Test => Ok(Command::CheckResolution),
            Commands::Logs {
                lines,
                filter,
                clear,
            } => {
                if *clear {
                    Ok(Command::ClearLogs)
                } else {
                    Ok(Command::Logs {
                        lines: *lines,
                        filter: filter.clone(),
                    })
                }
            }
            Commands::Shutdown => Ok(Command::Shutdown),
            Commands::Rescue { .. } => Err(DnsvisorError::Other(
                "Rescue commands run locally".to_string(),
            )),
        }
    }
}

fn run_rescue(config: &AgentConfig, action: RescueAction) -> Result<()> {
    let rescue = RescueCoordinator::new(&config.rescue)?;

    match action {
        RescueAction::Enable => {
            rescue.enable()?;
            output::print_success_msg(&format!(
                "Rescue mode on: DNS is forwarded to {}",
                rescue.fallback()
            ));
        }
        RescueAction::Disable => {
            rescue.disable()?;
            output::print_success_msg("Rescue mode off");
        }
        RescueAction::Status => {
            if rescue.is_active()? {
                output::print_warning(&format!(
                    "Rescue mode is active (fallback {})",
                    rescue.fallback()
                ));
            } else {
                output::print_info("Rescue mode is inactive");
            }
        }
    }

    Ok(())
}
