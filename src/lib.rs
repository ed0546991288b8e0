pub mod check;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod logs;
pub mod process;
pub mod reporter;
pub mod rescue;
pub mod schedule;
pub mod shutdown;
pub mod stats;
pub mod watch;
