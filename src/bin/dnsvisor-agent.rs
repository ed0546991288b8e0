use anyhow::Context;
use clap::Parser;
use dnsvisor::check::ResolutionCheck;
use dnsvisor::config::AgentConfig;
use dnsvisor::daemon::PidFile;
use dnsvisor::ipc::{ControlHandler, IpcServer};
use dnsvisor::logs::ResolverLog;
use dnsvisor::process::{ProcessSupervisor, RestartSignal};
use dnsvisor::reporter::StatsReporter;
use dnsvisor::schedule::{CronTrigger, MaintenanceTask, RuleUpdater};
use dnsvisor::shutdown::ShutdownSignal;
use dnsvisor::stats::{MetricsReader, StatsStore};
use dnsvisor::watch::FileWatchDebouncer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// Supervises the DNS resolver and serves the dnsvisor control socket
#[derive(Parser)]
#[command(name = "dnsvisor-agent", version, about)]
struct Args {
    /// Agent configuration file (defaults to $DNSVISOR_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AgentConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    dnsvisor::logging::init(&config.agent.log_level);

    let pid_file = PidFile::with_path(&config.agent.pid_file);
    pid_file.acquire().context("Failed to register agent")?;

    let result = run(config).await;

    if let Err(e) = pid_file.release() {
        warn!("Failed to remove PID file: {}", e);
    }

    if let Err(ref e) = result {
        error!("Agent failed: {:#}", e);
    }
    result
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    prepare_rules(&config.watch.rules_dir, &config.agent.required_rule_files)
        .context("Failed to prepare rule files")?;

    let shutdown = ShutdownSignal::new();
    let restart = RestartSignal::new();

    let reader = MetricsReader::new(&config.metrics).context("Failed to build metrics reader")?;
    let stats = Arc::new(StatsStore::new(&config.stats.path, Arc::new(reader)));

    let supervisor = ProcessSupervisor::new(config.resolver.clone(), Arc::clone(&stats), restart.clone());
    let status = supervisor.subscribe();

    let rules = Arc::new(
        RuleUpdater::new(&config.schedule, restart.clone())
            .context("Failed to build rule updater")?
            .watched_by(&config.watch.rules_dir),
    );
    let fire_time = config.schedule.fire_time()?;
    let cron = CronTrigger::new(fire_time, Arc::clone(&rules) as Arc<dyn MaintenanceTask>);

    let watcher = FileWatchDebouncer::new(&config.watch, restart.clone());
    let reporter = StatsReporter::new(&config.stats, Arc::clone(&stats));
    let check = Arc::new(ResolutionCheck::new(&config.check));

    let server = IpcServer::bind(&config.agent.socket_path).context("Failed to bind control socket")?;
    info!(socket = %server.socket_path().display(), "Control socket ready");

    let handler = Arc::new(ControlHandler::new(
        restart.clone(),
        Arc::clone(&stats),
        status.clone(),
        rules,
        Arc::clone(&check),
        ResolverLog::new(&config.agent.resolver_log),
        config.agent.cache_dump.clone(),
        shutdown.clone(),
    ));

    let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));

    let watch_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = watcher.run(watch_shutdown).await {
            error!("File watcher stopped: {}", e);
        }
    });
    tokio::spawn(cron.run(shutdown.clone()));
    tokio::spawn(reporter.run(shutdown.clone()));
    tokio::spawn(check.run_after_start(status, shutdown.clone()));

    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        server
            .run(
                move |cmd| {
                    let handler = Arc::clone(&handler);
                    async move { handler.handle(cmd).await }
                },
                server_shutdown,
            )
            .await;
        // Dropping the server removes the socket file
        drop(server);
    });

    info!("dnsvisor agent started");
    wait_for_termination(&shutdown).await?;
    shutdown.trigger();

    if let Err(e) = supervisor_task.await {
        error!("Supervisor task failed: {}", e);
    }
    if let Err(e) = server_task.await {
        error!("Control server task failed: {}", e);
    }

    info!("dnsvisor agent stopped");
    Ok(())
}

/// Resolve on SIGINT, SIGTERM or a shutdown requested over the control socket
async fn wait_for_termination(shutdown: &ShutdownSignal) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = shutdown.cancelled() => {}
    }

    Ok(())
}

/// The resolver refuses to start when a referenced rule file is missing
fn prepare_rules(rules_dir: &Path, required: &[String]) -> std::io::Result<()> {
    std::fs::create_dir_all(rules_dir)?;

    for name in required {
        let path = rules_dir.join(name);
        if !path.exists() {
            std::fs::File::create(&path)?;
            info!(path = %path.display(), "Created empty rule file");
        }
    }

    Ok(())
}
