//! Runtime settings read from the `config` table.
//!
//! Workers re-read the table on every poll tick, so `config set` takes
//! effect within one `poll_interval_ms` without a restart.

use std::collections::HashMap;
use std::time::Duration;

/// Config table keys.
pub mod keys {
    pub const POLL_INTERVAL_MS: &str = "poll_interval_ms";
    pub const BASE_BACKOFF_SECONDS: &str = "base_backoff_seconds";
    pub const MAX_BACKOFF_SECONDS: &str = "max_backoff_seconds";
    pub const LEASE_DURATION_SECONDS: &str = "lease_duration_seconds";
    pub const DEFAULT_MAX_RETRIES: &str = "default_max_retries";
    pub const EXEC_TIMEOUT_SECONDS: &str = "exec_timeout_seconds";

    /// Distinguished entry observed by all workers between jobs.
    pub const WORKERS_STOP: &str = "workers.stop";
}

/// Parsed worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Sleep between unsuccessful poll attempts.
    pub poll_interval: Duration,
    /// Base (and exponent base) of the retry backoff, in seconds.
    pub base_backoff_secs: u64,
    /// Backoff cap, in seconds.
    pub max_backoff_secs: u64,
    /// How long a claim is owned before it becomes reclaimable.
    pub lease_duration: Duration,
    /// `max_retries` applied to jobs enqueued without an explicit bound.
    pub default_max_retries: i64,
    /// Upper bound on a single command execution.
    pub exec_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            base_backoff_secs: 2,
            max_backoff_secs: 3600,
            lease_duration: Duration::from_secs(60),
            default_max_retries: 3,
            exec_timeout: Duration::from_secs(30),
        }
    }
}

impl Settings {
    /// Parse settings out of the raw config map. Missing or unparsable
    /// values fall back to the defaults; a bad `config set` must never
    /// take a worker down.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: Duration::from_millis(
                parse_or(map, keys::POLL_INTERVAL_MS, 500u64),
            ),
            base_backoff_secs: parse_or(map, keys::BASE_BACKOFF_SECONDS, defaults.base_backoff_secs),
            max_backoff_secs: parse_or(map, keys::MAX_BACKOFF_SECONDS, defaults.max_backoff_secs),
            lease_duration: Duration::from_secs(parse_or(
                map,
                keys::LEASE_DURATION_SECONDS,
                60u64,
            )),
            default_max_retries: parse_or(map, keys::DEFAULT_MAX_RETRIES, defaults.default_max_retries),
            exec_timeout: Duration::from_secs(parse_or(map, keys::EXEC_TIMEOUT_SECONDS, 30u64)),
        }
    }

    /// Default key/value pairs seeded into the config table at `init`.
    pub fn seed_defaults() -> [(&'static str, String); 7] {
        let d = Self::default();
        [
            (
                keys::POLL_INTERVAL_MS,
                d.poll_interval.as_millis().to_string(),
            ),
            (keys::BASE_BACKOFF_SECONDS, d.base_backoff_secs.to_string()),
            (keys::MAX_BACKOFF_SECONDS, d.max_backoff_secs.to_string()),
            (
                keys::LEASE_DURATION_SECONDS,
                d.lease_duration.as_secs().to_string(),
            ),
            (keys::DEFAULT_MAX_RETRIES, d.default_max_retries.to_string()),
            (
                keys::EXEC_TIMEOUT_SECONDS,
                d.exec_timeout.as_secs().to_string(),
            ),
            (keys::WORKERS_STOP, "0".to_string()),
        ]
    }
}

/// Whether the stop flag is raised in the given config map.
pub fn stop_requested(map: &HashMap<String, String>) -> bool {
    map.get(keys::WORKERS_STOP).map(String::as_str) == Some("1")
}

fn parse_or<T: std::str::FromStr + Copy>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
