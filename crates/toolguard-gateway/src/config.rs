//! Gateway configuration: TOML file + CLI overrides.

use crate::policy::{OnThreat, Policy, Severity};
use crate::scanner::ScanRule;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use toolguard_core::{SizeGuard, DEFAULT_DRAIN_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE};
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub default_policy: Policy,
    #[serde(default)]
    pub scanner: ScannerSection,
    #[serde(default)]
    pub upstreams: Vec<UpstreamSpec>,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_drain_chunk_size")]
    pub drain_chunk_size: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_max_tracked_clients")]
    pub max_tracked_clients: usize,
    #[serde(default)]
    pub stats_interval_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            max_message_size: default_max_message_size(),
            drain_chunk_size: default_drain_chunk_size(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            rate_limit_window_secs: default_rate_limit_window(),
            max_tracked_clients: default_max_tracked_clients(),
            stats_interval_secs: 0,
        }
    }
}

/// `[scanner]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScannerSection {
    #[serde(default)]
    pub rules: Vec<ScanRule>,
}

/// One `[[upstreams]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Overrides `[default_policy]` for this upstream.
    #[serde(default)]
    pub policy: Option<Policy>,
}

fn default_client_id() -> String {
    "stdio".to_string()
}
fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}
fn default_drain_chunk_size() -> usize {
    DEFAULT_DRAIN_CHUNK_SIZE
}
fn default_request_timeout() -> u64 {
    30
}
fn default_shutdown_grace() -> u64 {
    5
}
fn default_rate_limit_window() -> u64 {
    60
}
fn default_max_tracked_clients() -> usize {
    10_000
}

/// Overrides taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub on_threat: Option<OnThreat>,
    pub severity_threshold: Option<Severity>,
    pub rate_limit_per_minute: Option<u32>,
    /// `-- <command> [args...]`, registered as an upstream named `default`.
    pub upstream_command: Vec<String>,
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied,
/// validated).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub client_id: String,
    pub size_guard: SizeGuard,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub rate_limit_window: Duration,
    pub max_tracked_clients: usize,
    pub stats_interval: Option<Duration>,
    pub default_policy: Policy,
    pub scanner_rules: Vec<ScanRule>,
    pub upstreams: Vec<UpstreamSpec>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl GatewayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file is tolerated only when `required` is false.
    pub fn load(path: &Path, required: bool, cli: &CliOverrides) -> Result<Self, ConfigError> {
        let expanded = expand_tilde(path);
        let file = if expanded.exists() {
            info!(path = %expanded.display(), "loading config file");
            let content = std::fs::read_to_string(&expanded).map_err(|source| ConfigError::Read {
                path: expanded.clone(),
                source,
            })?;
            toml::from_str::<ConfigFile>(&content)?
        } else if required {
            return Err(ConfigError::Read {
                path: expanded,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        } else {
            info!(path = %expanded.display(), "config file not found, using defaults");
            ConfigFile::default()
        };
        if file.gateway.drain_chunk_size == 0 {
            return Err(ConfigError::Invalid("drain_chunk_size must be positive".into()));
        }

        let mut config = Self::from_file(file);
        config.apply(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(file: ConfigFile) -> Self {
        let g = file.gateway;
        Self {
            client_id: g.client_id,
            size_guard: SizeGuard::new(g.max_message_size, g.drain_chunk_size),
            request_timeout: Duration::from_secs(g.request_timeout_secs),
            shutdown_grace: Duration::from_secs(g.shutdown_grace_secs),
            rate_limit_window: Duration::from_secs(g.rate_limit_window_secs),
            max_tracked_clients: g.max_tracked_clients,
            stats_interval: (g.stats_interval_secs > 0)
                .then(|| Duration::from_secs(g.stats_interval_secs)),
            default_policy: file.default_policy,
            scanner_rules: file.scanner.rules,
            upstreams: file.upstreams,
        }
    }

    /// Merge CLI overrides.
    pub fn apply(&mut self, cli: &CliOverrides) {
        if let Some(on_threat) = cli.on_threat {
            self.default_policy.on_threat = on_threat;
        }
        if let Some(threshold) = cli.severity_threshold {
            self.default_policy.severity_threshold = threshold;
        }
        if let Some(limit) = cli.rate_limit_per_minute {
            self.default_policy.rate_limit_per_minute = limit;
        }
        if let Some((command, args)) = cli.upstream_command.split_first() {
            self.upstreams.push(UpstreamSpec {
                name: "default".to_string(),
                command: command.clone(),
                args: args.to_vec(),
                env: HashMap::new(),
                policy: None,
            });
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_guard.max_size() == 0 {
            return Err(ConfigError::Invalid("max_message_size must be positive".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("request_timeout_secs must be positive".into()));
        }
        if self.rate_limit_window.is_zero() {
            return Err(ConfigError::Invalid("rate_limit_window_secs must be positive".into()));
        }
        let mut seen = HashSet::new();
        for upstream in &self.upstreams {
            if upstream.name.is_empty() {
                return Err(ConfigError::Invalid("upstream name must not be empty".into()));
            }
            if upstream.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "upstream {} has an empty command",
                    upstream.name
                )));
            }
            if !seen.insert(upstream.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate upstream name: {}",
                    upstream.name
                )));
            }
        }
        for rule in &self.scanner_rules {
            regex::Regex::new(&rule.pattern).map_err(|e| {
                ConfigError::Invalid(format!("scanner rule {}: {e}", rule.name))
            })?;
        }
        Ok(())
    }

    /// Per-upstream policy overrides, keyed by upstream name.
    pub fn policy_overrides(&self) -> HashMap<String, Policy> {
        self.upstreams
            .iter()
            .filter_map(|u| u.policy.map(|p| (u.name.clone(), p)))
            .collect()
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
