// Daemon module - Agent process bookkeeping

pub mod pid;

pub use pid::PidFile;
