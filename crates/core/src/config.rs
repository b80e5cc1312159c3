#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "queuectl_config.json";

/// The fixed key set accepted by `config get/set`; anything else is rejected
/// so typos never silently create dead keys in the JSON file.
pub const CONFIG_KEYS: [&str; 5] = [
    "max-retries",
    "backoff-base",
    "job-timeout-seconds",
    "lease-ttl-seconds",
    "poll-interval-seconds",
];

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
    UnknownKey(String),
    InvalidValue { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "config io: {err}"),
            Self::Json(err) => write!(f, "config json: {err}"),
            Self::UnknownKey(key) => write!(f, "unknown configuration key '{key}'"),
            Self::InvalidValue { key, value } => {
                write!(f, "{key} must be an integer, got '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Read-through snapshot of `queuectl_config.json`. Components receive a
/// loaded value; callers that need decision-time freshness reload before
/// each decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueueConfig {
    pub max_retries: u32,
    pub backoff_base: u32,
    pub job_timeout_seconds: u64,
    pub lease_ttl_seconds: u64,
    pub poll_interval_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2,
            job_timeout_seconds: 300,
            lease_ttl_seconds: 300,
            poll_interval_seconds: 1,
        }
    }
}

impl QueueConfig {
    pub fn path(storage_dir: &Path) -> PathBuf {
        storage_dir.join(CONFIG_FILE)
    }

    /// Missing file yields the defaults; unknown keys in the file are ignored.
    pub fn load(storage_dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(storage_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, storage_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(storage_dir)?;
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(storage_dir), text)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<u64, ConfigError> {
        match key {
            "max-retries" => Ok(u64::from(self.max_retries)),
            "backoff-base" => Ok(u64::from(self.backoff_base)),
            "job-timeout-seconds" => Ok(self.job_timeout_seconds),
            "lease-ttl-seconds" => Ok(self.lease_ttl_seconds),
            "poll-interval-seconds" => Ok(self.poll_interval_seconds),
            other => Err(ConfigError::UnknownKey(other.to_string())),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key,
                value: value.to_string(),
            })
        }
        match key {
            "max-retries" => self.max_retries = parse("max-retries", value)?,
            "backoff-base" => self.backoff_base = parse("backoff-base", value)?,
            "job-timeout-seconds" => {
                self.job_timeout_seconds = parse("job-timeout-seconds", value)?;
            }
            "lease-ttl-seconds" => self.lease_ttl_seconds = parse("lease-ttl-seconds", value)?,
            "poll-interval-seconds" => {
                self.poll_interval_seconds = parse("poll-interval-seconds", value)?;
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Stable-ordered `(key, value)` pairs for `config list`.
    pub fn entries(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("max-retries", u64::from(self.max_retries)),
            ("backoff-base", u64::from(self.backoff_base)),
            ("job-timeout-seconds", self.job_timeout_seconds),
            ("lease-ttl-seconds", self.lease_ttl_seconds),
            ("poll-interval-seconds", self.poll_interval_seconds),
        ]
    }

    pub fn lease_ttl_ms(&self) -> i64 {
        saturating_s_to_ms(self.lease_ttl_seconds)
    }

    pub fn job_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.job_timeout_seconds)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_seconds)
    }
}

fn saturating_s_to_ms(seconds: u64) -> i64 {
    seconds
        .saturating_mul(1_000)
        .min(i64::MAX as u64)
        .try_into()
        .unwrap_or(i64::MAX)
}
