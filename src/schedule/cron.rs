use crate::error::Result;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime, TimeZone};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

/// Longest single sleep while waiting for the fire time
pub const DEFAULT_RECHECK: Duration = Duration::from_secs(15 * 60);

/// Work run by the daily trigger
#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<()>;
}

/// Next occurrence of `at` strictly after `now`, in `now`'s time zone
///
/// When `at` does not exist on a day (a DST gap) that day's run moves one
/// hour later. When it exists twice the earlier instant is used.
pub fn next_fire<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let today = now.date_naive();
    let candidate = resolve_local(&now.timezone(), today.and_time(at));
    if candidate > *now {
        return candidate;
    }

    let tomorrow = today.succ_opt().unwrap_or(today);
    resolve_local(&now.timezone(), tomorrow.and_time(at))
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> DateTime<Tz> {
    if let Some(t) = tz.from_local_datetime(&local).earliest() {
        return t;
    }
    if let Some(t) = tz
        .from_local_datetime(&(local + ChronoDuration::hours(1)))
        .earliest()
    {
        return t;
    }
    tz.from_utc_datetime(&local)
}

/// Runs a maintenance task once per day at a fixed local time
///
/// The fire time is recomputed from the wall clock after every run, and the
/// wait is split into naps of at most `recheck` so a clock adjustment is
/// noticed within that interval.
pub struct CronTrigger {
    at: NaiveTime,
    task: Arc<dyn MaintenanceTask>,
    recheck: Duration,
}

impl CronTrigger {
    pub fn new(at: NaiveTime, task: Arc<dyn MaintenanceTask>) -> Self {
        Self {
            at,
            task,
            recheck: DEFAULT_RECHECK,
        }
    }

    pub fn with_recheck(mut self, recheck: Duration) -> Self {
        self.recheck = recheck;
        self
    }

    pub async fn run(self, shutdown: ShutdownSignal) {
        loop {
            let target = next_fire(&Local::now(), self.at);
            info!(task = self.task.name(), next = %target.format("%Y-%m-%d %H:%M:%S %Z"), "Scheduled maintenance");

            loop {
                let now = Local::now();
                if now >= target {
                    break;
                }

                let remaining = (target - now).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = sleep(remaining.min(self.recheck)) => {}
                    _ = shutdown.cancelled() => return,
                }
            }

            info!(task = self.task.name(), "Running scheduled maintenance");
            if let Err(e) = self.task.run().await {
                error!(task = self.task.name(), "Scheduled maintenance failed: {}", e);
            }

            if shutdown.is_triggered() {
                return;
            }
        }
    }
}
