//! Node configuration.
//!
//! Every knob has a default; a TOML file only needs the keys it overrides.
//! Durations are written as integer milliseconds:
//!
//! ```toml
//! k = 16
//! heartbeat_interval_ms = 500
//! seeds = ["10.0.0.1:47400"]
//!
//! [beacon]
//! enabled = true
//! port = 47474
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::OverlayError;

/// Bucket capacity and lookup result size.
pub const DEFAULT_K: usize = 20;
/// Lookup parallelism.
pub const DEFAULT_ALPHA: usize = 3;
/// Retransmissions after the initial send before a delivery is given up.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Consecutive unanswered heartbeats before a contact is declared dead.
pub const DEFAULT_MISSED_HEARTBEATS: u32 = 3;
/// Hop budget stamped on new envelopes.
pub const DEFAULT_MESSAGE_TTL: u8 = 16;
/// Hop budget on route advertisements.
pub const DEFAULT_ADVERT_TTL: u8 = 8;
/// Default UDP port for the local-segment beacon.
pub const DEFAULT_BEACON_PORT: u16 = 47474;
/// Multicast group the beacon announces on.
pub const DEFAULT_BEACON_GROUP: &str = "239.255.60.61";

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BeaconConfig {
    pub enabled: bool,
    pub port: u16,
    pub group: String,
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_BEACON_PORT,
            group: DEFAULT_BEACON_GROUP.to_string(),
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Bootstrap seed addresses (`ip:port`).
    pub seeds: Vec<String>,

    pub k: usize,
    pub alpha: usize,
    pub max_lookup_iterations: usize,
    #[serde(rename = "lookup_query_timeout_ms", with = "millis")]
    pub lookup_query_timeout: Duration,
    #[serde(rename = "lookup_total_timeout_ms", with = "millis")]
    pub lookup_total_timeout: Duration,
    /// Timeout for a single request/response exchange (ping, find-node).
    #[serde(rename = "rpc_timeout_ms", with = "millis")]
    pub rpc_timeout: Duration,

    pub max_retries: u32,
    #[serde(rename = "retry_base_ms", with = "millis")]
    pub retry_base: Duration,
    #[serde(rename = "retry_cap_ms", with = "millis")]
    pub retry_cap: Duration,

    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,
    #[serde(rename = "heartbeat_timeout_ms", with = "millis")]
    pub heartbeat_timeout: Duration,
    pub missed_heartbeats: u32,
    /// Deaths within `partition_window` that count as a partition.
    pub partition_threshold: usize,
    #[serde(rename = "partition_window_ms", with = "millis")]
    pub partition_window: Duration,

    #[serde(rename = "refresh_interval_ms", with = "millis")]
    pub refresh_interval: Duration,
    /// Buckets refreshed per refresh tick.
    pub refresh_fanout: usize,

    #[serde(rename = "advert_interval_ms", with = "millis")]
    pub advert_interval: Duration,
    pub advert_ttl: u8,
    #[serde(rename = "route_staleness_ms", with = "millis")]
    pub route_staleness: Duration,
    /// Distinct next hops kept per destination.
    pub max_paths: usize,
    #[serde(rename = "buffer_timeout_ms", with = "millis")]
    pub buffer_timeout: Duration,
    pub buffer_capacity: usize,
    pub message_ttl: u8,

    /// Children per node in the group broadcast tree.
    pub tree_fanout: usize,
    #[serde(rename = "dedup_ttl_ms", with = "millis")]
    pub dedup_ttl: Duration,
    pub dedup_capacity: usize,

    pub beacon: BeaconConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            max_lookup_iterations: 20,
            lookup_query_timeout: Duration::from_secs(3),
            lookup_total_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(3),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(8),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(1),
            missed_heartbeats: DEFAULT_MISSED_HEARTBEATS,
            partition_threshold: 3,
            partition_window: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(60),
            refresh_fanout: 4,
            advert_interval: Duration::from_secs(30),
            advert_ttl: DEFAULT_ADVERT_TTL,
            route_staleness: Duration::from_secs(300),
            max_paths: 3,
            buffer_timeout: Duration::from_secs(10),
            buffer_capacity: 256,
            message_ttl: DEFAULT_MESSAGE_TTL,
            tree_fanout: 3,
            dedup_ttl: Duration::from_secs(120),
            dedup_capacity: 10_000,
            beacon: BeaconConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, OverlayError> {
        let config: Config = toml::from_str(s).map_err(|e| OverlayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), OverlayError> {
        let positive = [
            ("k", self.k),
            ("alpha", self.alpha),
            ("max_paths", self.max_paths),
            ("tree_fanout", self.tree_fanout),
            ("dedup_capacity", self.dedup_capacity),
            ("missed_heartbeats", self.missed_heartbeats as usize),
            ("message_ttl", self.message_ttl as usize),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(OverlayError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.retry_base.is_zero() || self.retry_cap < self.retry_base {
            return Err(OverlayError::Config(
                "retry_base_ms must be non-zero and not exceed retry_cap_ms".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_timeout.is_zero() {
            return Err(OverlayError::Config("heartbeat durations must be non-zero".into()));
        }
        if self.refresh_interval.is_zero() || self.advert_interval.is_zero() || self.beacon.interval.is_zero() {
            return Err(OverlayError::Config("periodic intervals must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().expect("default config validates");
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config = Config::from_toml_str(
            r#"
            k = 8
            heartbeat_interval_ms = 250
            seeds = ["127.0.0.1:4000"]

            [beacon]
            enabled = true
            "#,
        )
        .expect("parse");
        assert_eq!(config.k, 8);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.seeds, vec!["127.0.0.1:4000".to_string()]);
        assert!(config.beacon.enabled);
        assert_eq!(config.beacon.port, DEFAULT_BEACON_PORT);
        assert_eq!(config.alpha, DEFAULT_ALPHA);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml_str("bucket_size = 4").unwrap_err();
        assert!(matches!(err, OverlayError::Config(_)));
    }

    #[test]
    fn zero_k_is_rejected() {
        let err = Config::from_toml_str("k = 0").unwrap_err();
        assert!(matches!(err, OverlayError::Config(ref m) if m.contains("k must")));
    }
}
