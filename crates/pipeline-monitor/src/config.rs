// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cache::CacheConfig;
use crate::error::MonitorError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const MAX_SIZE_KEY: &str = "monitoring.latencies.max-size";
pub const MAX_AGE_SECONDS_KEY: &str = "monitoring.latencies.max-age-seconds";
pub const CONCURRENCY_KEY: &str = "monitoring.latencies.concurrency";
pub const EXTRA_ACK_EXCLUSIONS_KEY: &str = "monitoring.report.exclusions.extra-ack";
pub const IGNORED_STREAMS_KEY: &str = "monitoring.stream.ignore";
pub const ATTRIBUTES_KEY: &str = "monitoring.attributes";
pub const SAMPLE_EVERY_KEY: &str = "monitoring.sample-every";
pub const SWEEP_INTERVAL_SECONDS_KEY: &str = "monitoring.sweep-interval-seconds";

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_LOG_LEVEL: &str = "info";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

// Environment variable backing each configuration key.
const ENV_VARS: [(&str, &str); 8] = [
    (MAX_SIZE_KEY, "MONITOR_LATENCIES_MAX_SIZE"),
    (MAX_AGE_SECONDS_KEY, "MONITOR_LATENCIES_MAX_AGE_SECONDS"),
    (CONCURRENCY_KEY, "MONITOR_LATENCIES_CONCURRENCY"),
    (EXTRA_ACK_EXCLUSIONS_KEY, "MONITOR_EXTRA_ACK_EXCLUSIONS"),
    (IGNORED_STREAMS_KEY, "MONITOR_IGNORED_STREAMS"),
    (ATTRIBUTES_KEY, "MONITOR_ATTRIBUTES"),
    (SAMPLE_EVERY_KEY, "MONITOR_SAMPLE_EVERY"),
    (SWEEP_INTERVAL_SECONDS_KEY, "MONITOR_SWEEP_INTERVAL_SECONDS"),
];

/// Configuration of a [`crate::tracker::Tracker`]
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Bounds of the in-flight tracking cache
    pub cache: CacheConfig,
    /// Components allowed to confirm items the tracker does not know about
    pub extra_ack_exclusions: HashSet<String>,
    /// Streams whose items are never tracked
    pub ignored_streams: HashSet<String>,
    /// Attributes added to every event
    pub custom_attributes: BTreeMap<String, String>,
    /// Track one item in this many (0 and 1 track everything)
    pub sample_every: u64,
    /// Period of the background expiry sweep
    pub sweep_interval: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            extra_ack_exclusions: HashSet::new(),
            ignored_streams: HashSet::new(),
            custom_attributes: BTreeMap::new(),
            sample_every: 1,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl MonitorConfig {
    /// Create configuration from a flat string map
    pub fn from_map(conf: &HashMap<String, String>) -> Result<Self, MonitorError> {
        let defaults = Self::default();
        let get = |key: &str| conf.get(key).map(String::as_str);

        let cache = CacheConfig {
            max_size: parse_or(get(MAX_SIZE_KEY), MAX_SIZE_KEY, defaults.cache.max_size),
            max_age: Duration::from_secs(parse_or(
                get(MAX_AGE_SECONDS_KEY),
                MAX_AGE_SECONDS_KEY,
                defaults.cache.max_age.as_secs(),
            )),
            concurrency: parse_or(get(CONCURRENCY_KEY), CONCURRENCY_KEY, defaults.cache.concurrency),
        };

        let config = Self {
            cache,
            extra_ack_exclusions: parse_list(get(EXTRA_ACK_EXCLUSIONS_KEY)),
            ignored_streams: parse_list(get(IGNORED_STREAMS_KEY)),
            custom_attributes: get(ATTRIBUTES_KEY)
                .map(parse_attributes)
                .unwrap_or_default(),
            sample_every: parse_or(get(SAMPLE_EVERY_KEY), SAMPLE_EVERY_KEY, defaults.sample_every),
            sweep_interval: Duration::from_secs(parse_or(
                get(SWEEP_INTERVAL_SECONDS_KEY),
                SWEEP_INTERVAL_SECONDS_KEY,
                defaults.sweep_interval.as_secs(),
            )),
            log_level: defaults.log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, MonitorError> {
        let conf: HashMap<String, String> = ENV_VARS
            .iter()
            .filter_map(|(key, var)| env::var(var).ok().map(|value| ((*key).to_string(), value)))
            .collect();

        let mut config = Self::from_map(&conf)?;
        config.log_level = env::var("MONITOR_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.cache.max_size == 0 {
            return Err(MonitorError::InvalidConfig(
                "Latencies max size must be greater than 0".to_string(),
            ));
        }

        if self.cache.max_age.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "Latencies max age must be greater than 0".to_string(),
            ));
        }

        if self.cache.concurrency == 0 {
            return Err(MonitorError::InvalidConfig(
                "Latencies concurrency must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "Sweep interval must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(MonitorError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

fn parse_or<T: FromStr + Copy>(raw: Option<&str>, key: &str, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable value '{}' for {}", raw, key);
            default
        }),
    }
}

/// Splits a comma separated list, dropping empty entries.
#[must_use]
pub fn parse_list(raw: Option<&str>) -> HashSet<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Parses `key=value` pairs separated by commas. Malformed pairs are skipped.
#[must_use]
pub fn parse_attributes(raw: &str) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    for pair in raw.split(',').filter(|pair| !pair.trim().is_empty()) {
        let parts = pair.split('=').collect::<Vec<&str>>();
        if parts.len() != 2 || parts[0].trim().is_empty() {
            warn!("Bad format of custom attribute - {}", pair);
            continue;
        }
        attributes.insert(parts[0].trim().to_string(), parts[1].trim().to_string());
    }
    attributes
}
