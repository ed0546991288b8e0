use dnsvisor::cli::{print_error, Cli};
use dnsvisor::error::DnsvisorError;

fn main() {
    match Cli::run() {
        Ok(()) => {}
        // Already reported by the response printer
        Err(DnsvisorError::CommandRejected(_)) => std::process::exit(1),
        Err(e) => {
            print_error(&e.to_string());
            std::process::exit(1);
        }
    }
}
