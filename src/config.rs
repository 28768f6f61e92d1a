use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub redis: RedisConfig,
    pub core_service: CoreServiceConfig,
    #[serde(default)]
    pub hostsnap: HostSnapConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
    #[serde(default = "default_snapshot_key_prefix")]
    pub snapshot_key_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreServiceConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_owner_id")]
    pub owner_id: String,
    #[serde(default = "default_user")]
    pub user: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HostSnapConfig {
    #[serde(default)]
    pub qps: Option<LooseInt>,
    #[serde(default)]
    pub burst: Option<LooseInt>,
    #[serde(default)]
    pub change_range_percent: Option<LooseInt>,
    #[serde(default)]
    pub refresh_interval: Option<String>,
    #[serde(default)]
    pub page_size: Option<u64>,
}

/// Integer setting that may also be written as a quoted string.
/// Any other YAML shape is kept as `Other` and resolves to the default.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum LooseInt {
    Int(i64),
    Text(String),
    Other(serde_yaml::Value),
}

/// Pipeline settings after defaults and floors are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub qps: u32,
    pub burst: u32,
    pub change_range_percent: u32,
    pub refresh_interval: Duration,
    pub page_size: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.workers < 1 {
            return Err(ConfigError::Validation("workers must be >= 1".to_string()));
        }
        if self.redis.url.trim().is_empty() {
            return Err(ConfigError::Validation("redis.url is required".to_string()));
        }
        if self.redis.channels.iter().all(|c| c.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "redis.channels must name at least one channel".to_string(),
            ));
        }
        if self.core_service.base_url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "core_service.base_url is required".to_string(),
            ));
        }
        if self.core_service.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "core_service.timeout_ms must be > 0".to_string(),
            ));
        }
        if self.hostsnap.page_size == Some(0) {
            return Err(ConfigError::Validation(
                "hostsnap.page_size must be >= 1".to_string(),
            ));
        }
        if let Some(raw) = &self.hostsnap.refresh_interval {
            match humantime::parse_duration(raw) {
                Ok(interval) if !interval.is_zero() => {}
                Ok(_) => {
                    return Err(ConfigError::Validation(
                        "hostsnap.refresh_interval must be > 0".to_string(),
                    ))
                }
                Err(err) => {
                    return Err(ConfigError::Validation(format!(
                        "hostsnap.refresh_interval '{raw}' is not a duration: {err}"
                    )))
                }
            }
        }

        Ok(())
    }

    /// Resolves the lenient pipeline settings. Bad values fall back to their
    /// default or floor and are logged; they never fail startup.
    pub fn tuning(&self) -> Tuning {
        let snap = &self.hostsnap;
        Tuning {
            qps: resolve_int(snap.qps.as_ref(), "hostsnap.qps", DEFAULT_QPS, 1),
            burst: resolve_int(snap.burst.as_ref(), "hostsnap.burst", DEFAULT_BURST, 1),
            change_range_percent: resolve_int(
                snap.change_range_percent.as_ref(),
                "hostsnap.change_range_percent",
                DEFAULT_CHANGE_RANGE_PERCENT,
                MIN_CHANGE_RANGE_PERCENT,
            ),
            refresh_interval: snap
                .refresh_interval
                .as_deref()
                .and_then(|raw| humantime::parse_duration(raw).ok())
                .unwrap_or(DEFAULT_REFRESH_INTERVAL),
            page_size: snap.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
        }
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

pub const DEFAULT_QPS: u32 = 40;
pub const DEFAULT_BURST: u32 = 100;
pub const DEFAULT_CHANGE_RANGE_PERCENT: u32 = 10;
pub const MIN_CHANGE_RANGE_PERCENT: u32 = 1;
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_PAGE_SIZE: u64 = 1000;

fn resolve_int(raw: Option<&LooseInt>, name: &str, default: u32, min: u32) -> u32 {
    let parsed = match raw {
        Some(LooseInt::Int(v)) => Some(*v),
        Some(LooseInt::Text(s)) => s.trim().parse::<i64>().ok(),
        Some(LooseInt::Other(_)) | None => None,
    };
    let value = match parsed {
        Some(v) => v,
        None => {
            error!(setting = name, default, "setting missing or not an integer, using default");
            i64::from(default)
        }
    };
    if value < i64::from(min) {
        error!(setting = name, value, min, "setting below minimum, using minimum");
        return min;
    }
    u32::try_from(value).unwrap_or(u32::MAX)
}

const fn default_workers() -> usize {
    16
}

fn default_channels() -> Vec<String> {
    vec!["2_snapshot".to_string()]
}

fn default_snapshot_key_prefix() -> String {
    "cc:v3:snapshot:".to_string()
}

const fn default_timeout_ms() -> u64 {
    5000
}

fn default_owner_id() -> String {
    "0".to_string()
}

fn default_user() -> String {
    "cc_collector".to_string()
}
