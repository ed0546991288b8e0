// IPC module - Control channel between the CLI and the agent

pub mod client;
pub mod handler;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use handler::ControlHandler;
pub use protocol::{Command, Request, ResolverStatus, Response, ResponseData};
pub use server::IpcServer;
