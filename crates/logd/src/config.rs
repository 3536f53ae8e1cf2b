// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration.
//!
//! A plain pushed value: whoever loads or reloads configuration hands a
//! fresh `Config` to the components that need it, and the core holds no
//! file-system knowledge. `from_env` builds one from `LOGD_*` environment
//! variables with hard-coded defaults underneath; invalid values are logged
//! and fall back to the default rather than aborting startup.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::error;

#[derive(Debug, Clone)]
pub struct Config {
    /// UDP bind address for the ingest server.
    pub host: String,
    pub port: u16,
    /// Graphite-style stats sink.
    pub graphite_host: String,
    pub graphite_port: u16,
    /// Log flush: batcher drain into the store.
    pub flush_interval: Duration,
    /// Stats flush: aggregator snapshot to the sink. Also the window length
    /// used for per-second normalization.
    pub stats_interval: Duration,
    /// Retention trim across all known paths.
    pub trim_interval: Duration,
    /// Name-set refresh in the store.
    pub aggregates_interval: Duration,
    /// Throughput log heartbeat.
    pub log_interval: Duration,
    /// Timer trimming percentile, in (0, 100].
    pub percent_threshold: u8,
    /// Retention cap for paths without an explicit entry in `log_sizes`.
    pub default_log_size: usize,
    /// Per-path retention caps.
    pub log_sizes: HashMap<String, usize>,
    /// Enables the periodic aggregator state dump.
    pub debug: bool,
    /// Cadence of the state dump when `debug` is set.
    pub debug_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 8126,
            graphite_host: "localhost".to_string(),
            graphite_port: 2003,
            flush_interval: Duration::from_millis(1000),
            stats_interval: Duration::from_millis(10_000),
            trim_interval: Duration::from_millis(10_000),
            aggregates_interval: Duration::from_millis(60_000),
            log_interval: Duration::from_millis(1000),
            percent_threshold: 90,
            default_log_size: 100_000,
            log_sizes: HashMap::new(),
            debug: false,
            debug_interval: Duration::from_millis(10_000),
        }
    }
}

impl Config {
    /// Builds a config from `LOGD_*` environment variables over defaults.
    #[must_use]
    pub fn from_env() -> Config {
        let mut config = Config::default();

        if let Ok(host) = env::var("LOGD_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("LOGD_PORT") {
            config.port = port;
        }
        if let Ok(host) = env::var("LOGD_GRAPHITE_HOST") {
            config.graphite_host = host;
        }
        if let Some(port) = env_parse("LOGD_GRAPHITE_PORT") {
            config.graphite_port = port;
        }
        if let Some(ms) = env_parse("LOGD_FLUSH_INTERVAL_MS") {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("LOGD_STATS_INTERVAL_MS") {
            config.stats_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("LOGD_TRIM_INTERVAL_MS") {
            config.trim_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("LOGD_AGGREGATES_INTERVAL_MS") {
            config.aggregates_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("LOGD_LOG_INTERVAL_MS") {
            config.log_interval = Duration::from_millis(ms);
        }
        if let Ok(raw) = env::var("LOGD_PERCENT_THRESHOLD") {
            match parse_percent_threshold(&raw) {
                Some(threshold) => config.percent_threshold = threshold,
                None => error!(
                    "invalid LOGD_PERCENT_THRESHOLD '{raw}', using default {}",
                    config.percent_threshold
                ),
            }
        }
        if let Some(size) = env_parse("LOGD_LOG_SIZE") {
            config.default_log_size = size;
        }
        if let Ok(raw) = env::var("LOGD_LOG_SIZES") {
            match parse_log_sizes(&raw) {
                Some(sizes) => config.log_sizes = sizes,
                None => error!("invalid LOGD_LOG_SIZES '{raw}', expected a JSON object of path to cap"),
            }
        }
        if let Ok(raw) = env::var("LOGD_DEBUG") {
            config.debug = matches!(raw.trim().to_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Some(ms) = env_parse("LOGD_DEBUG_INTERVAL_MS") {
            config.debug_interval = Duration::from_millis(ms);
        }

        config
    }

    /// The retention cap for a path: its explicit entry, or the default.
    #[must_use]
    pub fn retention_cap(&self, path: &str) -> usize {
        self.log_sizes
            .get(path)
            .copied()
            .unwrap_or(self.default_log_size)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            error!("invalid value for {name}: '{raw}', using default");
            None
        }
    }
}

/// A threshold of 0 would trim every sample and one above 100 is
/// meaningless, so both are rejected.
fn parse_percent_threshold(raw: &str) -> Option<u8> {
    let threshold: u8 = raw.trim().parse().ok()?;
    if (1..=100).contains(&threshold) {
        Some(threshold)
    } else {
        None
    }
}

fn parse_log_sizes(raw: &str) -> Option<HashMap<String, usize>> {
    serde_json::from_str(raw).ok()
}
