// Daily maintenance: the wall-clock trigger and the rule refresh it runs

pub mod cron;
pub mod rules;

pub use cron::{next_fire, CronTrigger, MaintenanceTask};
pub use rules::{install_if_changed, RuleUpdateSummary, RuleUpdater};
