// Rescue mode - DNS failover through dedicated iptables NAT chains
//
// All rules live in two chains owned by this module; unrelated NAT rules on
// the host are never touched.

use crate::config::RescueConfig;
use crate::error::{DnsvisorError, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info, warn};

const IP_FORWARD_FLAG: &str = "/proc/sys/net/ipv4/ip_forward";

/// Upper bound on duplicate jump rules removed by `disable`
const MAX_UNSPLICE: usize = 16;

/// Result of running one external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// stdout followed by stderr
    pub output: String,
}

/// Runs privileged host tools
///
/// Implementations return [`DnsvisorError::ToolMissing`] when the program
/// is not installed and `Ok` with `success == false` when it ran and failed.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Runs commands on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program).args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DnsvisorError::ToolMissing(program.to_string())
            } else {
                DnsvisorError::Io(e)
            }
        })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            success: output.status.success(),
            output: text.trim().to_string(),
        })
    }
}

pub struct RescueCoordinator<R: CommandRunner = SystemRunner> {
    runner: R,
    fallback: SocketAddr,
    redirect_chain: String,
    reply_chain: String,
    forward_flag: PathBuf,
}

impl RescueCoordinator<SystemRunner> {
    pub fn new(config: &RescueConfig) -> Result<Self> {
        Self::with_runner(config, SystemRunner)
    }
}

impl<R: CommandRunner> RescueCoordinator<R> {
    pub fn with_runner(config: &RescueConfig, runner: R) -> Result<Self> {
        let fallback = config.fallback.parse::<SocketAddr>().map_err(|e| {
            DnsvisorError::InvalidConfig(format!(
                "Invalid rescue fallback '{}': {}",
                config.fallback, e
            ))
        })?;

        Ok(Self {
            runner,
            fallback,
            redirect_chain: config.redirect_chain.clone(),
            reply_chain: config.reply_chain.clone(),
            forward_flag: PathBuf::from(IP_FORWARD_FLAG),
        })
    }

    /// Read the forwarding state from another file
    pub fn with_forward_flag(mut self, path: impl Into<PathBuf>) -> Self {
        self.forward_flag = path.into();
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn fallback(&self) -> SocketAddr {
        self.fallback
    }

    /// Install the failover path. Safe to repeat: the dedicated chains are rewritten.
    ///
    /// On a host without the packet-filter tools this logs a warning and
    /// does nothing.
    pub fn enable(&self) -> Result<()> {
        match self.install() {
            Err(DnsvisorError::ToolMissing(tool)) => {
                warn!(tool = %tool, "Rescue mode unavailable on this host");
                Ok(())
            }
            result => result,
        }
    }

    /// Remove the failover path. Never fails for chains that do not exist.
    pub fn disable(&self) -> Result<()> {
        for (builtin, chain) in self.splices() {
            for _ in 0..MAX_UNSPLICE {
                let removed = self.tolerate(
                    self.nat(&["-D", builtin, "-j", chain]),
                    "remove jump rule",
                );
                if !removed {
                    break;
                }
            }
        }

        for chain in [self.redirect_chain.as_str(), self.reply_chain.as_str()] {
            self.tolerate(self.nat(&["-F", chain]), "flush chain");
            self.tolerate(self.nat(&["-X", chain]), "delete chain");
        }

        info!("Rescue mode disabled");
        Ok(())
    }

    /// Whether the redirect chain currently exists
    pub fn is_active(&self) -> Result<bool> {
        match self.nat(&["-L", &self.redirect_chain, "-n"]) {
            Ok(()) => Ok(true),
            Err(DnsvisorError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn install(&self) -> Result<()> {
        info!(fallback = %self.fallback, "Enabling rescue mode");

        self.ensure_forwarding()?;

        for proto in ["udp", "tcp"] {
            let rule = ["-p", proto, "--dport", "53", "-j", "ACCEPT"];
            if !self.rule_exists("filter", "INPUT", &rule)? {
                let mut args = vec!["-I", "INPUT"];
                args.extend_from_slice(&rule);
                self.tolerate(self.iptables(&args), "accept inbound DNS");
            }
        }

        for chain in [self.redirect_chain.as_str(), self.reply_chain.as_str()] {
            // Already existing is the normal case on a repeated enable
            self.tolerate(self.nat(&["-N", chain]), "create chain");
            self.nat(&["-F", chain])?;
        }

        let destination = self.fallback.to_string();
        let fallback_ip = self.fallback.ip().to_string();

        for proto in ["udp", "tcp"] {
            self.nat(&[
                "-A",
                &self.redirect_chain,
                "-p",
                proto,
                "--dport",
                "53",
                "-j",
                "DNAT",
                "--to-destination",
                &destination,
            ])?;
        }
        self.nat(&["-A", &self.reply_chain, "-d", &fallback_ip, "-j", "MASQUERADE"])?;

        for (builtin, chain) in self.splices() {
            if !self.rule_exists("nat", builtin, &["-j", chain])? {
                self.nat(&["-I", builtin, "-j", chain])?;
            }
        }

        info!("Rescue mode enabled");
        Ok(())
    }

    fn ensure_forwarding(&self) -> Result<()> {
        if let Ok(value) = std::fs::read_to_string(&self.forward_flag) {
            if value.trim() == "1" {
                debug!("IP forwarding already enabled");
                return Ok(());
            }
        }

        self.exec("sysctl", &["-w", "net.ipv4.ip_forward=1"])
    }

    fn splices(&self) -> [(&'static str, &str); 2] {
        [
            ("PREROUTING", self.redirect_chain.as_str()),
            ("POSTROUTING", self.reply_chain.as_str()),
        ]
    }

    /// Checked with `-C`; a failed check means the rule is absent
    fn rule_exists(&self, table: &str, chain: &str, rule: &[&str]) -> Result<bool> {
        let mut args = vec!["-t", table, "-C", chain];
        args.extend_from_slice(rule);

        match self.exec("iptables", &args) {
            Ok(()) => Ok(true),
            Err(DnsvisorError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn nat(&self, args: &[&str]) -> Result<()> {
        let mut full = vec!["-t", "nat"];
        full.extend_from_slice(args);
        self.exec("iptables", &full)
    }

    fn iptables(&self, args: &[&str]) -> Result<()> {
        self.exec("iptables", args)
    }

    fn exec(&self, program: &str, args: &[&str]) -> Result<()> {
        let result = self.runner.run(program, args)?;
        if result.success {
            Ok(())
        } else {
            Err(DnsvisorError::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                output: result.output,
            })
        }
    }

    /// Log a non-critical failure; `true` when the step succeeded
    fn tolerate(&self, result: Result<()>, step: &str) -> bool {
        match result {
            Ok(()) => true,
            Err(DnsvisorError::ToolMissing(tool)) => {
                warn!(tool = %tool, "Skipping '{}': tool not installed", step);
                false
            }
            Err(e) => {
                debug!("Ignoring failed '{}': {}", step, e);
                false
            }
        }
    }
}
