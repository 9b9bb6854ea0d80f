use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryConfig;

/// Process settings, read once from `FLIGHTLINE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
    /// Extra attempts for a failed WAL write during booking.
    pub storage_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            metrics_port: None,
            storage_retries: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparsable values fall back to the
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let lookup = &lookup;

        Self {
            port: parse_var(lookup, "FLIGHTLINE_PORT").unwrap_or(defaults.port),
            bind: lookup("FLIGHTLINE_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("FLIGHTLINE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parse_var(lookup, "FLIGHTLINE_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(lookup, "FLIGHTLINE_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            compact_interval: parse_var(lookup, "FLIGHTLINE_COMPACT_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.compact_interval),
            metrics_port: parse_var(lookup, "FLIGHTLINE_METRICS_PORT"),
            storage_retries: parse_var(lookup, "FLIGHTLINE_STORAGE_RETRIES").unwrap_or(defaults.storage_retries),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("flightline.wal")
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.storage_retries,
            ..RetryConfig::default()
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
