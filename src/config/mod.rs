use crate::error::{DnsvisorError, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when no `--config` path is given
pub const CONFIG_ENV: &str = "DNSVISOR_CONFIG";

/// Complete agent configuration
///
/// Every section is optional in the file; missing sections and fields fall
/// back to the defaults of a stock resolver container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub rescue: RescueConfig,
    #[serde(default)]
    pub check: CheckConfig,
    #[serde(default)]
    pub agent: AgentSettings,
}

/// Where a child standard stream goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioTarget {
    Inherit,
    Null,
    /// Append to a file, created if missing
    File(PathBuf),
}

impl Default for StdioTarget {
    fn default() -> Self {
        StdioTarget::Inherit
    }
}

/// How the resolver child is launched and paced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Path to the resolver executable
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Fixed argument vector
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Working directory for the child
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub stdout: StdioTarget,

    #[serde(default)]
    pub stderr: StdioTarget,

    /// Delay between failed launch attempts (in seconds)
    #[serde(default = "default_launch_retry")]
    pub launch_retry_secs: u64,

    /// Pause after the child exits on its own (in seconds)
    #[serde(default = "default_crash_pause")]
    pub crash_pause_secs: u64,

    /// How long shutdown waits for the child after SIGTERM (in seconds)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/mosdns")
}

fn default_args() -> Vec<String> {
    vec![
        "start".to_string(),
        "-c".to_string(),
        "/etc/mosdns/config.yaml".to_string(),
    ]
}

fn default_launch_retry() -> u64 {
    5
}

fn default_crash_pause() -> u64 {
    1
}

fn default_stop_timeout() -> u64 {
    10
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: default_args(),
            working_dir: None,
            stdout: StdioTarget::Inherit,
            stderr: StdioTarget::Inherit,
            launch_retry_secs: default_launch_retry(),
            crash_pause_secs: default_crash_pause(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl ResolverConfig {
    pub fn launch_retry(&self) -> Duration {
        Duration::from_secs(self.launch_retry_secs)
    }

    pub fn crash_pause(&self) -> Duration {
        Duration::from_secs(self.crash_pause_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Names of the four cache counters in the resolver's exposition output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterNames {
    pub query: String,
    pub hit: String,
    pub miss: String,
    pub lazy_hit: String,
}

impl Default for CounterNames {
    fn default() -> Self {
        Self {
            query: "mosdns_cache_query_total".to_string(),
            hit: "mosdns_cache_hit_total".to_string(),
            miss: "mosdns_cache_miss_total".to_string(),
            lazy_hit: "mosdns_cache_lazy_hit_total".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub url: String,
    pub timeout_ms: u64,
    pub counters: CounterNames,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/metrics".to_string(),
            timeout_ms: 2000,
            counters: CounterNames::default(),
        }
    }
}

impl MetricsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Persisted carry-forward record
    pub path: PathBuf,
    pub report_initial_delay_secs: u64,
    pub report_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/etc/mosdns/stats_history.json"),
            report_initial_delay_secs: 60,
            report_interval_secs: 6 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub config_file: PathBuf,
    pub rules_dir: PathBuf,
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("/etc/mosdns/config.yaml"),
            rules_dir: PathBuf::from("/etc/mosdns/rules"),
            debounce_ms: 1000,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// One downloadable rule list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSource {
    pub url: String,
    pub dest: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Local wall-clock time of the daily maintenance run, `HH:MM`
    pub daily_at: String,
    pub rule_sources: Vec<RuleSource>,
    pub download_timeout_secs: u64,
    /// Downloads smaller than this are treated as error pages
    pub min_rule_bytes: usize,
}

const RULE_MIRROR: &str = "https://gh-proxy.com/https://raw.githubusercontent.com/Loyalsoldier";

impl Default for ScheduleConfig {
    fn default() -> Self {
        let source = |path: &str, dest: &str| RuleSource {
            url: format!("{}/{}", RULE_MIRROR, path),
            dest: PathBuf::from(dest),
        };

        Self {
            daily_at: "02:30".to_string(),
            rule_sources: vec![
                source(
                    "v2ray-rules-dat/release/direct-list.txt",
                    "/etc/mosdns/rules/geosite_cn.txt",
                ),
                source("geoip/release/text/cn.txt", "/etc/mosdns/rules/geoip_cn.txt"),
                source(
                    "v2ray-rules-dat/release/apple-cn.txt",
                    "/etc/mosdns/rules/geosite_apple.txt",
                ),
                source(
                    "v2ray-rules-dat/release/proxy-list.txt",
                    "/etc/mosdns/rules/geosite_no_cn.txt",
                ),
            ],
            download_timeout_secs: 60,
            min_rule_bytes: 100,
        }
    }
}

impl ScheduleConfig {
    /// Parse `daily_at` into a time of day
    pub fn fire_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(self.daily_at.trim(), "%H:%M").map_err(|e| {
            DnsvisorError::ConfigValidationError(format!(
                "Invalid schedule.daily_at '{}': {}",
                self.daily_at, e
            ))
        })
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RescueConfig {
    /// External resolver that receives redirected DNS traffic
    pub fallback: String,
    /// Dedicated chain spliced into nat PREROUTING
    pub redirect_chain: String,
    /// Dedicated chain spliced into nat POSTROUTING
    pub reply_chain: String,
}

impl Default for RescueConfig {
    fn default() -> Self {
        Self {
            fallback: "223.5.5.5:53".to_string(),
            redirect_chain: "DNSVISOR_RESCUE".to_string(),
            reply_chain: "DNSVISOR_RESCUE_POST".to_string(),
        }
    }
}

/// One domain looked up by the resolution check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTarget {
    pub label: String,
    pub domain: String,
}

/// Lookups run through the local resolver once it has started
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Server address handed to `nslookup`
    pub server: String,
    pub targets: Vec<CheckTarget>,
    /// Wait after the first successful launch before checking
    pub startup_delay_secs: u64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        let target = |label: &str, domain: &str| CheckTarget {
            label: label.to_string(),
            domain: domain.to_string(),
        };

        Self {
            server: "127.0.0.1".to_string(),
            targets: vec![
                target("domestic", "www.baidu.com"),
                target("foreign", "www.google.com"),
            ],
            startup_delay_secs: 3,
        }
    }
}

impl CheckConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    /// Resolver cache snapshot removed by a flush
    pub cache_dump: PathBuf,
    /// Resolver log file served by the `logs` command
    pub resolver_log: PathBuf,
    pub log_level: String,
    /// Rule files that must exist (possibly empty) before the resolver starts
    pub required_rule_files: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/dnsvisor.sock"),
            pid_file: PathBuf::from("/tmp/dnsvisor-agent.pid"),
            cache_dump: PathBuf::from("/etc/mosdns/cache.dump"),
            resolver_log: PathBuf::from("/var/log/mosdns.log"),
            log_level: "info".to_string(),
            required_rule_files: vec![
                "force-cn.txt".to_string(),
                "force-nocn.txt".to_string(),
                "user_iot.txt".to_string(),
                "hosts.txt".to_string(),
            ],
        }
    }
}

impl AgentConfig {
    /// Resolve the configuration for this run
    ///
    /// An explicit path must exist. Without one, `DNSVISOR_CONFIG` is
    /// consulted; if that is unset or points nowhere, defaults are used.
    pub fn load(explicit: Option<&Path>) -> Result<AgentConfig> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        match std::env::var_os(CONFIG_ENV) {
            Some(path) if Path::new(&path).exists() => Self::from_file(Path::new(&path)),
            _ => {
                let config = AgentConfig::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Load configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<AgentConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DnsvisorError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config: AgentConfig = match extension {
            "toml" => toml::from_str(&contents)
                .map_err(|e| DnsvisorError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| DnsvisorError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?,
            _ => {
                return Err(DnsvisorError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.resolver.binary.as_os_str().is_empty() {
            return Err(DnsvisorError::ConfigValidationError(
                "resolver.binary must not be empty".to_string(),
            ));
        }

        if self.resolver.launch_retry_secs == 0 {
            return Err(DnsvisorError::ConfigValidationError(
                "resolver.launch_retry_secs must be at least 1".to_string(),
            ));
        }

        if self.watch.debounce_ms == 0 {
            return Err(DnsvisorError::ConfigValidationError(
                "watch.debounce_ms must be at least 1".to_string(),
            ));
        }

        if !(self.metrics.url.starts_with("http://") || self.metrics.url.starts_with("https://")) {
            return Err(DnsvisorError::ConfigValidationError(format!(
                "metrics.url must be an http(s) URL: {}",
                self.metrics.url
            )));
        }

        if self.stats.report_interval_secs == 0 {
            return Err(DnsvisorError::ConfigValidationError(
                "stats.report_interval_secs must be at least 1".to_string(),
            ));
        }

        self.schedule.fire_time()?;

        if self.rescue.fallback.parse::<SocketAddr>().is_err() {
            return Err(DnsvisorError::ConfigValidationError(format!(
                "rescue.fallback must be an IP:port address: {}",
                self.rescue.fallback
            )));
        }

        if self.rescue.redirect_chain.is_empty() || self.rescue.reply_chain.is_empty() {
            return Err(DnsvisorError::ConfigValidationError(
                "rescue chain names must not be empty".to_string(),
            ));
        }

        if self.rescue.redirect_chain == self.rescue.reply_chain {
            return Err(DnsvisorError::ConfigValidationError(
                "rescue chains must have distinct names".to_string(),
            ));
        }

        if self.check.server.trim().is_empty() {
            return Err(DnsvisorError::ConfigValidationError(
                "check.server must not be empty".to_string(),
            ));
        }

        if let Some(target) = self.check.targets.iter().find(|t| t.domain.trim().is_empty()) {
            return Err(DnsvisorError::ConfigValidationError(format!(
                "check target '{}' has no domain",
                target.label
            )));
        }

        Ok(())
    }

    fn expand_env_vars(&mut self) {
        self.resolver.binary = expand_env_in_path(&self.resolver.binary);
        self.resolver.args = self
            .resolver
            .args
            .iter()
            .map(|arg| expand_env_in_string(arg))
            .collect();
        if let Some(ref dir) = self.resolver.working_dir {
            self.resolver.working_dir = Some(expand_env_in_path(dir));
        }

        self.stats.path = expand_env_in_path(&self.stats.path);
        self.watch.config_file = expand_env_in_path(&self.watch.config_file);
        self.watch.rules_dir = expand_env_in_path(&self.watch.rules_dir);
        self.agent.socket_path = expand_env_in_path(&self.agent.socket_path);
        self.agent.pid_file = expand_env_in_path(&self.agent.pid_file);
        self.agent.cache_dump = expand_env_in_path(&self.agent.cache_dump);
        self.agent.resolver_log = expand_env_in_path(&self.agent.resolver_log);
    }
}

/// Expand `$VAR` and `${VAR}` references in a string
fn expand_env_in_string(s: &str) -> String {
    let mut result = s.to_string();

    // Longest names first so `$HOME_DIR` is not clobbered by `$HOME`
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    for (key, value) in vars {
        result = result.replace(&format!("${{{}}}", key), &value);
        result = result.replace(&format!("${}", key), &value);
    }

    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resolver.launch_retry(), Duration::from_secs(5));
        assert_eq!(config.resolver.crash_pause(), Duration::from_secs(1));
        assert_eq!(config.watch.debounce(), Duration::from_secs(1));
        assert_eq!(
            config.schedule.fire_time().unwrap(),
            NaiveTime::from_hms_opt(2, 30, 0).unwrap()
        );
        assert_eq!(config.schedule.rule_sources.len(), 4);
    }

    #[test]
    fn test_load_toml_partial() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agent.toml");
        fs::write(
            &path,
            r#"
[resolver]
binary = "/bin/sleep"
args = ["30"]
stdout = "null"
stderr = { file = "/tmp/resolver.err" }

[watch]
debounce_ms = 250

[schedule]
daily_at = "04:15"
rule_sources = []
"#,
        )
        .unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.resolver.binary, PathBuf::from("/bin/sleep"));
        assert_eq!(config.resolver.args, vec!["30".to_string()]);
        assert_eq!(config.resolver.stdout, StdioTarget::Null);
        assert_eq!(
            config.resolver.stderr,
            StdioTarget::File(PathBuf::from("/tmp/resolver.err"))
        );
        assert_eq!(config.resolver.launch_retry_secs, 5);
        assert_eq!(config.watch.debounce_ms, 250);
        assert!(config.schedule.rule_sources.is_empty());
        assert_eq!(config.metrics.url, "http://127.0.0.1:8080/metrics");
    }

    #[test]
    fn test_load_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agent.json");
        fs::write(&path, r#"{"rescue": {"fallback": "1.1.1.1:53"}}"#).unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.rescue.fallback, "1.1.1.1:53");
        assert_eq!(config.rescue.redirect_chain, "DNSVISOR_RESCUE");
    }

    #[test]
    fn test_unsupported_extension() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agent.yaml");
        fs::write(&path, "resolver: {}").unwrap();

        let result = AgentConfig::from_file(&path);
        assert!(matches!(result, Err(DnsvisorError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_bad_time() {
        let mut config = AgentConfig::default();
        config.schedule.daily_at = "25:99".to_string();
        assert!(matches!(
            config.validate(),
            Err(DnsvisorError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_check_section() {
        let defaults = CheckConfig::default();
        assert_eq!(defaults.server, "127.0.0.1");
        assert_eq!(defaults.targets.len(), 2);
        assert_eq!(defaults.startup_delay(), Duration::from_secs(3));

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agent.toml");
        fs::write(
            &path,
            "[check]\nserver = \"127.0.0.53\"\ntargets = [{ label = \"lan\", domain = \"router.lan\" }]\n",
        )
        .unwrap();
        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.check.server, "127.0.0.53");
        assert_eq!(config.check.targets[0].domain, "router.lan");
        assert_eq!(config.check.startup_delay_secs, 3);

        let mut config = AgentConfig::default();
        config.check.targets[1].domain = " ".to_string();
        assert!(matches!(
            config.validate(),
            Err(DnsvisorError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_fallback() {
        let mut config = AgentConfig::default();
        config.rescue.fallback = "dns.example".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_debounce() {
        let mut config = AgentConfig::default();
        config.watch.debounce_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_shared_chain_name() {
        let mut config = AgentConfig::default();
        config.rescue.reply_chain = config.rescue.redirect_chain.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("DNSVISOR_TEST_ROOT", "/srv/dns");
        assert_eq!(
            expand_env_in_string("${DNSVISOR_TEST_ROOT}/rules"),
            "/srv/dns/rules"
        );
        assert_eq!(
            expand_env_in_string("$DNSVISOR_TEST_ROOT/config.yaml"),
            "/srv/dns/config.yaml"
        );
    }
}
