// Rescue mode against a simulated packet filter

use dnsvisor::config::RescueConfig;
use dnsvisor::error::{DnsvisorError, Result};
use dnsvisor::rescue::{CommandOutput, CommandRunner, RescueCoordinator};
use std::collections::HashMap;
use std::sync::Mutex;
use tempfile::TempDir;

/// Keeps iptables chains in memory and applies the subset of commands rescue mode uses
struct PacketFilter {
    chains: Mutex<HashMap<(String, String), Vec<String>>>,
    sysctl_calls: Mutex<usize>,
}

impl PacketFilter {
    fn new() -> Self {
        let mut chains = HashMap::new();
        for (table, chain) in [
            ("filter", "INPUT"),
            ("nat", "PREROUTING"),
            ("nat", "POSTROUTING"),
        ] {
            chains.insert((table.to_string(), chain.to_string()), Vec::new());
        }

        Self {
            chains: Mutex::new(chains),
            sysctl_calls: Mutex::new(0),
        }
    }

    fn rules(&self, table: &str, chain: &str) -> Option<Vec<String>> {
        self.chains
            .lock()
            .unwrap()
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
    }

    fn seed(&self, table: &str, chain: &str, rule: &str) {
        self.chains
            .lock()
            .unwrap()
            .get_mut(&(table.to_string(), chain.to_string()))
            .unwrap()
            .push(rule.to_string());
    }

    fn iptables(&self, args: &[&str]) -> bool {
        let (table, args) = match args {
            ["-t", table, rest @ ..] => (table.to_string(), rest),
            _ => ("filter".to_string(), args),
        };
        let (op, chain, rule) = match args {
            [op, chain, rest @ ..] => (*op, chain.to_string(), rest.join(" ")),
            _ => return false,
        };

        let mut chains = self.chains.lock().unwrap();
        let key = (table.clone(), chain.clone());
        let jump = format!("-j {}", chain);

        match op {
            "-N" => {
                if chains.contains_key(&key) {
                    return false;
                }
                chains.insert(key, Vec::new());
                true
            }
            "-X" => {
                let referenced = chains
                    .iter()
                    .any(|((t, _), rules)| *t == table && rules.contains(&jump));
                let removable =
                    !referenced && chains.get(&key).map(|r| r.is_empty()).unwrap_or(false);
                if removable {
                    chains.remove(&key);
                }
                removable
            }
            "-L" => chains.contains_key(&key),
            _ => {
                let Some(rules) = chains.get_mut(&key) else {
                    return false;
                };
                match op {
                    "-F" => {
                        rules.clear();
                        true
                    }
                    "-A" => {
                        rules.push(rule);
                        true
                    }
                    "-I" => {
                        rules.insert(0, rule);
                        true
                    }
                    "-C" => rules.contains(&rule),
                    "-D" => match rules.iter().position(|r| *r == rule) {
                        Some(index) => {
                            rules.remove(index);
                            true
                        }
                        None => false,
                    },
                    _ => false,
                }
            }
        }
    }
}

impl CommandRunner for PacketFilter {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let success = match program {
            "iptables" => self.iptables(args),
            "sysctl" => {
                *self.sysctl_calls.lock().unwrap() += 1;
                true
            }
            other => return Err(DnsvisorError::ToolMissing(other.to_string())),
        };

        Ok(CommandOutput {
            success,
            output: if success {
                String::new()
            } else {
                "iptables: No chain/target/match by that name.".to_string()
            },
        })
    }
}

fn rescue(dir: &TempDir) -> RescueCoordinator<PacketFilter> {
    let flag = dir.path().join("ip_forward");
    std::fs::write(&flag, "0\n").unwrap();
    RescueCoordinator::with_runner(&RescueConfig::default(), PacketFilter::new())
        .unwrap()
        .with_forward_flag(flag)
}

fn count(rules: &[String], rule: &str) -> usize {
    rules.iter().filter(|r| r.as_str() == rule).count()
}

#[test]
fn test_enable_twice_leaves_one_splice() {
    let dir = TempDir::new().unwrap();
    let rescue = rescue(&dir);
    let filter = rescue.runner();
    filter.seed("nat", "PREROUTING", "-p tcp --dport 80 -j REDIRECT --to-ports 8080");

    rescue.enable().unwrap();
    rescue.enable().unwrap();

    let prerouting = filter.rules("nat", "PREROUTING").unwrap();
    assert_eq!(count(&prerouting, "-j DNSVISOR_RESCUE"), 1);
    assert_eq!(prerouting.len(), 2);

    let postrouting = filter.rules("nat", "POSTROUTING").unwrap();
    assert_eq!(count(&postrouting, "-j DNSVISOR_RESCUE_POST"), 1);

    let redirect = filter.rules("nat", "DNSVISOR_RESCUE").unwrap();
    assert_eq!(
        redirect,
        vec![
            "-p udp --dport 53 -j DNAT --to-destination 223.5.5.5:53".to_string(),
            "-p tcp --dport 53 -j DNAT --to-destination 223.5.5.5:53".to_string(),
        ]
    );
    assert_eq!(
        filter.rules("nat", "DNSVISOR_RESCUE_POST").unwrap(),
        vec!["-d 223.5.5.5 -j MASQUERADE".to_string()]
    );

    let input = filter.rules("filter", "INPUT").unwrap();
    assert_eq!(count(&input, "-p udp --dport 53 -j ACCEPT"), 1);
    assert_eq!(count(&input, "-p tcp --dport 53 -j ACCEPT"), 1);

    assert_eq!(*filter.sysctl_calls.lock().unwrap(), 2);
    assert!(rescue.is_active().unwrap());
}

#[test]
fn test_disable_removes_only_own_rules() {
    let dir = TempDir::new().unwrap();
    let rescue = rescue(&dir);
    let filter = rescue.runner();
    filter.seed("nat", "PREROUTING", "-p tcp --dport 80 -j REDIRECT --to-ports 8080");

    rescue.enable().unwrap();
    rescue.disable().unwrap();

    assert!(!rescue.is_active().unwrap());
    assert!(filter.rules("nat", "DNSVISOR_RESCUE").is_none());
    assert!(filter.rules("nat", "DNSVISOR_RESCUE_POST").is_none());
    assert_eq!(
        filter.rules("nat", "PREROUTING").unwrap(),
        vec!["-p tcp --dport 80 -j REDIRECT --to-ports 8080".to_string()]
    );
    assert!(filter.rules("nat", "POSTROUTING").unwrap().is_empty());
}

#[test]
fn test_disable_without_enable_is_harmless() {
    let dir = TempDir::new().unwrap();
    let rescue = rescue(&dir);

    rescue.disable().unwrap();
    rescue.disable().unwrap();
    assert!(!rescue.is_active().unwrap());
}

#[test]
fn test_disable_clears_duplicate_jumps() {
    let dir = TempDir::new().unwrap();
    let rescue = rescue(&dir);
    let filter = rescue.runner();

    rescue.enable().unwrap();
    // Left behind by an older, non-idempotent run
    filter.seed("nat", "PREROUTING", "-j DNSVISOR_RESCUE");
    filter.seed("nat", "PREROUTING", "-j DNSVISOR_RESCUE");

    rescue.disable().unwrap();

    assert!(filter.rules("nat", "PREROUTING").unwrap().is_empty());
    assert!(filter.rules("nat", "DNSVISOR_RESCUE").is_none());
}

#[test]
fn test_enable_after_disable_restores_rules() {
    let dir = TempDir::new().unwrap();
    let rescue = rescue(&dir);
    let filter = rescue.runner();

    rescue.enable().unwrap();
    rescue.disable().unwrap();
    rescue.enable().unwrap();

    assert_eq!(
        count(&filter.rules("nat", "PREROUTING").unwrap(), "-j DNSVISOR_RESCUE"),
        1
    );
    assert_eq!(filter.rules("nat", "DNSVISOR_RESCUE").unwrap().len(), 2);
}
