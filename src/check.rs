// Resolution check - lookups through the local resolver after it starts

use crate::config::{CheckConfig, CheckTarget};
use crate::error::{DnsvisorError, Result};
use crate::process::{SupervisorState, SupervisorStatus};
use crate::rescue::{CommandRunner, SystemRunner};
use crate::shutdown::ShutdownSignal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const LOOKUP_TOOL: &str = "nslookup";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupOutcome {
    Passed {
        latency_ms: u64,
        /// First answer address, when the tool printed one
        address: Option<String>,
    },
    Failed { reason: String },
    /// The lookup tool is not installed
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResult {
    pub label: String,
    pub domain: String,
    pub outcome: LookupOutcome,
}

impl LookupResult {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, LookupOutcome::Passed { .. })
    }
}

/// Resolves a fixed set of domains against the supervised resolver
pub struct ResolutionCheck {
    runner: Arc<dyn CommandRunner>,
    server: String,
    targets: Vec<CheckTarget>,
    startup_delay: Duration,
}

impl ResolutionCheck {
    pub fn new(config: &CheckConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    pub fn with_runner(config: &CheckConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            server: config.server.clone(),
            targets: config.targets.clone(),
            startup_delay: config.startup_delay(),
        }
    }

    /// Look up every target in order
    ///
    /// Blocks on the external tool. A missing tool marks every target as
    /// skipped instead of failing.
    pub fn run(&self) -> Vec<LookupResult> {
        let mut results = Vec::with_capacity(self.targets.len());

        for target in &self.targets {
            let outcome = match self.lookup(&target.domain) {
                Ok(outcome) => outcome,
                Err(DnsvisorError::ToolMissing(tool)) => {
                    warn!("{} is not installed, skipping resolution check", tool);
                    return self
                        .targets
                        .iter()
                        .map(|t| result(t, LookupOutcome::Skipped))
                        .collect();
                }
                Err(e) => LookupOutcome::Failed {
                    reason: e.to_string(),
                },
            };
            results.push(result(target, outcome));
        }

        results
    }

    /// [`run`](Self::run) on the blocking pool
    pub async fn run_blocking(self: Arc<Self>) -> Result<Vec<LookupResult>> {
        tokio::task::spawn_blocking(move || self.run())
            .await
            .map_err(|e| DnsvisorError::Other(format!("Resolution check aborted: {}", e)))
    }

    /// Run once, `startup_delay` after the resolver first reports running
    pub async fn run_after_start(
        self: Arc<Self>,
        mut status: watch::Receiver<SupervisorStatus>,
        shutdown: ShutdownSignal,
    ) {
        let started = tokio::select! {
            running = async {
                status.wait_for(|s| s.state == SupervisorState::Running).await.is_ok()
            } => running,
            _ = shutdown.cancelled() => false,
        };
        if !started {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.startup_delay) => {}
            _ = shutdown.cancelled() => return,
        }

        match self.run_blocking().await {
            Ok(results) => log_results(&results),
            Err(e) => warn!("{}", e),
        }
    }

    fn lookup(&self, domain: &str) -> Result<LookupOutcome> {
        let started = Instant::now();
        let output = self.runner.run(LOOKUP_TOOL, &[domain, self.server.as_str()])?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if output.success {
            Ok(LookupOutcome::Passed {
                latency_ms,
                address: first_answer(&output.output, &self.server),
            })
        } else {
            let reason = output
                .output
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("lookup failed")
                .to_string();
            Ok(LookupOutcome::Failed { reason })
        }
    }
}

fn result(target: &CheckTarget, outcome: LookupOutcome) -> LookupResult {
    LookupResult {
        label: target.label.clone(),
        domain: target.domain.clone(),
        outcome,
    }
}

/// First `Address:` line that is not the queried server itself
fn first_answer(output: &str, server: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Address:"))
        .map(str::trim)
        .find(|address| !address.contains("#53") && !address.starts_with(server))
        .map(str::to_string)
}

pub fn log_results(results: &[LookupResult]) {
    for entry in results {
        match &entry.outcome {
            LookupOutcome::Passed {
                latency_ms,
                address,
            } => info!(
                label = %entry.label,
                domain = %entry.domain,
                latency_ms,
                address = address.as_deref().unwrap_or("-"),
                "Resolution check passed"
            ),
            LookupOutcome::Failed { reason } => warn!(
                label = %entry.label,
                domain = %entry.domain,
                "Resolution check failed: {}",
                reason
            ),
            LookupOutcome::Skipped => {
                debug!(domain = %entry.domain, "Resolution check skipped")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rescue::CommandOutput;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const GLIBC_ANSWER: &str = "Server:\t\t127.0.0.1\nAddress:\t127.0.0.1#53\n\nNon-authoritative answer:\nwww.baidu.com\tcanonical name = www.a.shifen.com.\nName:\twww.a.shifen.com\nAddress: 110.242.68.66\nName:\twww.a.shifen.com\nAddress: 110.242.68.3\n";

    /// Answers lookups from a table; unknown domains fail like NXDOMAIN
    struct ScriptedLookups {
        answers: HashMap<&'static str, &'static str>,
        calls: Mutex<Vec<String>>,
        installed: bool,
    }

    impl ScriptedLookups {
        fn new(answers: &[(&'static str, &'static str)]) -> Self {
            Self {
                answers: answers.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
                installed: true,
            }
        }
    }

    impl CommandRunner for ScriptedLookups {
        fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
            if !self.installed {
                return Err(DnsvisorError::ToolMissing(program.to_string()));
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} {}", program, args.join(" ")));

            Ok(match self.answers.get(args[0]) {
                Some(answer) => CommandOutput {
                    success: true,
                    output: answer.to_string(),
                },
                None => CommandOutput {
                    success: false,
                    output: format!(
                        "Server:\t\t127.0.0.1\nAddress:\t127.0.0.1#53\n\n** server can't find {}: NXDOMAIN",
                        args[0]
                    ),
                },
            })
        }
    }

    fn check(runner: Arc<ScriptedLookups>) -> ResolutionCheck {
        let config = CheckConfig {
            startup_delay_secs: 0,
            ..CheckConfig::default()
        };
        ResolutionCheck::with_runner(&config, runner)
    }

    #[test]
    fn test_pass_and_fail_are_reported_per_domain() {
        let runner = Arc::new(ScriptedLookups::new(&[("www.baidu.com", GLIBC_ANSWER)]));
        let results = check(runner.clone()).run();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].label, "domestic");
        match &results[0].outcome {
            LookupOutcome::Passed { address, .. } => {
                assert_eq!(address.as_deref(), Some("110.242.68.66"))
            }
            other => panic!("expected pass, got {:?}", other),
        }
        assert_eq!(
            results[1].outcome,
            LookupOutcome::Failed {
                reason: "** server can't find www.google.com: NXDOMAIN".to_string()
            }
        );

        assert_eq!(
            *runner.calls.lock().unwrap(),
            vec![
                "nslookup www.baidu.com 127.0.0.1".to_string(),
                "nslookup www.google.com 127.0.0.1".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_tool_skips_every_target() {
        let mut runner = ScriptedLookups::new(&[]);
        runner.installed = false;

        let results = check(Arc::new(runner)).run();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome == LookupOutcome::Skipped));
        assert!(!results.iter().any(LookupResult::passed));
    }

    #[test]
    fn test_first_answer_skips_server_lines() {
        assert_eq!(
            first_answer(GLIBC_ANSWER, "127.0.0.1").as_deref(),
            Some("110.242.68.66")
        );
        assert_eq!(first_answer("Address: 127.0.0.1\n", "127.0.0.1"), None);
        assert_eq!(first_answer("", "127.0.0.1"), None);
    }

    #[tokio::test]
    async fn test_runs_once_after_first_start() {
        let runner = Arc::new(ScriptedLookups::new(&[]));
        let check = Arc::new(check(runner.clone()));
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::new());

        let task = tokio::spawn(check.run_after_start(status_rx, ShutdownSignal::new()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runner.calls.lock().unwrap().is_empty());

        status_tx.send_modify(|s| s.state = SupervisorState::Running);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runner.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_skips_check() {
        let runner = Arc::new(ScriptedLookups::new(&[]));
        let check = Arc::new(check(runner.clone()));
        let (_status_tx, status_rx) = watch::channel(SupervisorStatus::new());
        let shutdown = ShutdownSignal::new();

        let task = tokio::spawn(check.run_after_start(status_rx, shutdown.clone()));
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(runner.calls.lock().unwrap().is_empty());
    }
}
