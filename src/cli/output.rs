// Output formatting and display for CLI

use crate::check::{LookupOutcome, LookupResult};
use crate::ipc::{ResolverStatus, ResponseData};
use crate::process::SupervisorState;
use crate::schedule::RuleUpdateSummary;
use crate::stats::StatsReport;
use colored::*;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print a successful agent response to stdout
pub fn print_response(data: &ResponseData) {
    match data {
        ResponseData::Status(status) => print_status(status),

        ResponseData::RestartRequested { already_pending } => {
            if *already_pending {
                print_info("A restart is already pending");
            } else {
                print_success_msg("Resolver restart requested");
            }
        }

        ResponseData::Flushed { dump_removed } => {
            print_success_msg("Cache flushed, resolver restarting");
            if !dump_removed {
                print_info("No cache dump was present");
            }
        }

        ResponseData::Stats(report) => print_stats(report),

        ResponseData::RulesUpdated(summary) => print_rule_summary(summary),

        ResponseData::Resolution(results) => print_resolution(results),

        ResponseData::Logs(lines) => print_logs(lines),

        ResponseData::Success(message) => print_success_msg(message),
    }
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "!".yellow().bold(), message);
}

fn print_status(status: &ResolverStatus) {
    println!("\n{}", "Resolver".bold().underline());
    println!();
    println!("  {:<15} {}", "State:".bold(), format_state_colored(status.state));

    match status.pid {
        Some(pid) => println!("  {:<15} {}", "PID:".bold(), pid),
        None => println!("  {:<15} {}", "PID:".bold(), "-".dimmed()),
    }

    if status.pid.is_some() {
        println!(
            "  {:<15} {}",
            "Uptime:".bold(),
            format_duration(&Duration::from_secs(status.uptime_secs))
        );
    }

    if let Some(cpu) = status.cpu_percent {
        println!("  {:<15} {:.1}%", "CPU Usage:".bold(), cpu);
    }
    if let Some(memory) = status.memory_bytes {
        println!("  {:<15} {}", "Memory:".bold(), format_memory(memory));
    }

    println!("  {:<15} {}", "Restarts:".bold(), status.restarts);

    if let Some(ref last_exit) = status.last_exit {
        println!("  {:<15} {}", "Last Exit:".bold(), last_exit);
    }

    println!("  {:<15} {}", "Log Size:".bold(), format_memory(status.log_bytes));
    println!();
}

/// Print cumulative cache statistics as a table
fn print_stats(report: &StatsReport) {
    #[derive(Tabled)]
    struct StatRow {
        #[tabled(rename = "Counter")]
        name: &'static str,
        #[tabled(rename = "Total")]
        value: String,
    }

    let counters = &report.counters;
    let rows = vec![
        StatRow {
            name: "Queries",
            value: counters.query.to_string(),
        },
        StatRow {
            name: "Cache hits",
            value: counters.hit.to_string(),
        },
        StatRow {
            name: "Cache misses",
            value: counters.miss.to_string(),
        },
        StatRow {
            name: "Lazy hits",
            value: counters.lazy_hit.to_string(),
        },
        StatRow {
            name: "Hit rate",
            value: format!("{:.2}%", report.hit_rate * 100.0),
        },
    ];

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
}

fn print_rule_summary(summary: &RuleUpdateSummary) {
    for path in &summary.updated {
        print_success_msg(&format!("Updated {}", path.display()));
    }
    for path in &summary.unchanged {
        println!("  {} {}", "unchanged".dimmed(), path.display());
    }
    for (url, reason) in &summary.failed {
        print_warning(&format!("{}: {}", url, reason));
    }

    if summary.restart_requested {
        print_info("Resolver restart requested");
    } else if summary.updated.is_empty() {
        print_info("Rules already up to date");
    }
}

fn print_resolution(results: &[LookupResult]) {
    if results.is_empty() {
        print_info("No check domains configured");
        return;
    }

    for entry in results {
        let target = format!("{} ({})", entry.label, entry.domain);
        match &entry.outcome {
            LookupOutcome::Passed {
                latency_ms,
                address,
            } => {
                let answer = address
                    .as_deref()
                    .map(|a| format!(" -> {}", a))
                    .unwrap_or_default();
                print_success_msg(&format!("{} passed in {}ms{}", target, latency_ms, answer));
            }
            LookupOutcome::Failed { reason } => {
                println!("{} {} failed: {}", "✗".red().bold(), target, reason);
            }
            LookupOutcome::Skipped => {
                print_warning(&format!("{} skipped, nslookup is not installed", target));
            }
        }
    }
}

fn print_logs(lines: &[String]) {
    if lines.is_empty() {
        println!("{}", "No logs available".yellow());
        return;
    }

    for line in lines {
        println!("{}", colorize_log_line(line));
    }
}

fn colorize_log_line(line: &str) -> String {
    if line.contains("ERROR") || line.contains("error") {
        line.red().to_string()
    } else if line.contains("WARN") || line.contains("warn") {
        line.yellow().to_string()
    } else {
        line.to_string()
    }
}

/// Format a supervisor state with color coding
fn format_state_colored(state: SupervisorState) -> String {
    match state {
        SupervisorState::Running => state.to_string().green().to_string(),
        SupervisorState::Starting => state.to_string().yellow().to_string(),
        SupervisorState::Stopping => state.to_string().yellow().to_string(),
        SupervisorState::Terminated => state.to_string().red().bold().to_string(),
    }
}

/// Format a duration in human-readable format
pub fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

/// Format a byte count in human-readable format
pub fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}
