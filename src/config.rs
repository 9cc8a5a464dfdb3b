//! Engine configuration, loadable from TOML. Every option has a default, so
//! an empty file (or no file) is a valid configuration.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: &'static str, message: String },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub sample_interval_ms: u64,
    pub refresh_timeout_ms: u64,
    pub disk_root: PathBuf,
    pub kill_grace_period_ms: u64,
    pub kill_poll_interval_ms: u64,
    pub probe_address: String,
    pub max_port_attempts: u16,
    pub port_settle_delay_ms: u64,
    pub port_kill_retries: u32,
    pub max_scan_range: u32,
    pub scan_max_depth: usize,
    pub scan_max_entries: u64,
    pub scan_time_budget_ms: u64,
    pub scan_max_results: usize,
    pub operation_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2000,
            refresh_timeout_ms: 10_000,
            disk_root: default_disk_root(),
            kill_grace_period_ms: 2000,
            kill_poll_interval_ms: 50,
            probe_address: "127.0.0.1".to_string(),
            max_port_attempts: 100,
            port_settle_delay_ms: 250,
            port_kill_retries: 8,
            max_scan_range: 4096,
            scan_max_depth: 32,
            scan_max_entries: 1_000_000,
            scan_time_budget_ms: 30_000,
            scan_max_results: 500,
            operation_timeout_ms: 30_000,
        }
    }
}

fn default_disk_root() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("C:\\")
    } else {
        PathBuf::from("/")
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("sample_interval_ms", self.sample_interval_ms),
            ("refresh_timeout_ms", self.refresh_timeout_ms),
            ("kill_grace_period_ms", self.kill_grace_period_ms),
            ("kill_poll_interval_ms", self.kill_poll_interval_ms),
            ("scan_time_budget_ms", self.scan_time_budget_ms),
            ("operation_timeout_ms", self.operation_timeout_ms),
            ("max_port_attempts", u64::from(self.max_port_attempts)),
            ("max_scan_range", u64::from(self.max_scan_range)),
            ("scan_max_entries", self.scan_max_entries),
            ("scan_max_results", self.scan_max_results as u64),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.probe_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "probe_address",
                message: format!("'{}' is not an IP address", self.probe_address),
            });
        }
        if self.disk_root.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "disk_root",
                message: "must not be empty".to_string(),
            });
        }
        let kill_port_ms = self.kill_port_worst_case_ms();
        if self.operation_timeout_ms < kill_port_ms {
            return Err(ConfigError::InvalidValue {
                field: "operation_timeout_ms",
                message: format!(
                    "{} ms cannot fit one full kill plus the port re-checks ({kill_port_ms} ms)",
                    self.operation_timeout_ms
                ),
            });
        }
        Ok(())
    }

    /// One SIGTERM-to-SIGKILL escalation plus every settle delay of a
    /// `KillPort` resolution.
    fn kill_port_worst_case_ms(&self) -> u64 {
        self.kill_grace_period_ms
            .saturating_mul(2)
            .saturating_add(self.kill_poll_interval_ms)
            .saturating_add(self.port_settle_delay_ms.saturating_mul(u64::from(self.port_kill_retries)))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn kill_grace_period(&self) -> Duration {
        Duration::from_millis(self.kill_grace_period_ms)
    }

    pub fn kill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.kill_poll_interval_ms)
    }

    pub fn port_settle_delay(&self) -> Duration {
        Duration::from_millis(self.port_settle_delay_ms)
    }

    pub fn scan_time_budget(&self) -> Duration {
        Duration::from_millis(self.scan_time_budget_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Validated in [`EngineConfig::validate`]; falls back to loopback if a
    /// caller mutated the field afterwards.
    pub fn probe_ip(&self) -> IpAddr {
        self.probe_address
            .parse()
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
    }
}
