//! Pipeline configuration.
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `THREAT_SCORE_THRESHOLD_SUSPICIOUS`: suspicious threshold (default: 0.5)
//! - `THREAT_SCORE_THRESHOLD_MALICIOUS`: malicious threshold (default: 0.8)
//! - `SCORE_JUMP_THRESHOLD`: minimum score movement reported as a jump (default: 0.2)
//! - `SCORE_DEFAULT`: score substituted when scoring a node fails (default: 0.0)
//! - `PUBLISH_MAX_RETRIES`: retries of the publish phase (default: 3)
//! - `STORE_IO_TIMEOUT_SECS`: bound on each store get/put (default: 30)
//! - `SRC_JSON_PATH`: raw input graph (default: `Data/network_topology.json`)
//! - `OUT_JSON_PATH`: published snapshot (default: `Data/network_topology_scored.json`)
//! - `OUT_CHANGES_LATEST`: latest delta pointer (default: `Data/changes/latest.json`)
//! - `OUT_CHANGES_HISTORY_DIR`: per-run delta history (default: `Data/changes/history`)
//! - `OUT_STATE_INDEX`: state index (default: `Data/state/index.json`)
//! - `SAFE_PATH_PREFIX`: prefix for isolated writes (default: `Data/safe`)
//!
//! Unset variables fall back to defaults; set but unparseable or invalid
//! values are load errors.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::client::StorePaths;
use crate::policy::{DeltaPolicy, Thresholds};
use crate::policy::thresholds::{
    DEFAULT_JUMP_THRESHOLD, DEFAULT_MALICIOUS_THRESHOLD, DEFAULT_SUSPICIOUS_THRESHOLD,
};

/// Error type for configuration loading.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Thresholds are out of range or not strictly increasing.
    #[error("Invalid thresholds: suspicious={suspicious}, malicious={malicious} (need 0 <= suspicious < malicious <= 1)")]
    InvalidThresholds {
        /// Suspicious threshold.
        suspicious: f64,
        /// Malicious threshold.
        malicious: f64,
    },
    /// Jump threshold is not in (0, 1].
    #[error("Invalid jump threshold: {0} (need 0 < jump <= 1)")]
    InvalidJumpThreshold(f64),
    /// Default score is not in [0, 1].
    #[error("Invalid default score: {0} (need 0 <= score <= 1)")]
    InvalidDefaultScore(f64),
    /// Store I/O timeout is zero.
    #[error("Invalid store I/O timeout: must be at least one second")]
    ZeroIoTimeout,
    /// An environment variable could not be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: String,
        /// Raw value.
        value: String,
    },
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Status classification thresholds.
    pub thresholds: Thresholds,
    /// Change detection policy.
    pub delta: DeltaPolicy,
    /// Score substituted for nodes whose scoring failed.
    pub default_score: f64,
    /// Bounded retries of the publish phase (conflicts and transient I/O).
    pub max_retries: u32,
    /// Bound on each store get/put.
    #[serde(with = "duration_secs")]
    pub io_timeout: Duration,
    /// Store paths.
    pub paths: StorePaths,
    /// Prefix applied to every output path in safe mode.
    pub safe_prefix: String,
}

impl PipelineConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = StorePaths::default();

        let thresholds = Thresholds::new(
            parse_or(&lookup, "THREAT_SCORE_THRESHOLD_SUSPICIOUS", DEFAULT_SUSPICIOUS_THRESHOLD)?,
            parse_or(&lookup, "THREAT_SCORE_THRESHOLD_MALICIOUS", DEFAULT_MALICIOUS_THRESHOLD)?,
        )?;
        let delta = DeltaPolicy::new(parse_or(&lookup, "SCORE_JUMP_THRESHOLD", DEFAULT_JUMP_THRESHOLD)?)?;

        let default_score: f64 = parse_or(&lookup, "SCORE_DEFAULT", 0.0)?;
        if !default_score.is_finite() || !(0.0..=1.0).contains(&default_score) {
            return Err(ConfigError::InvalidDefaultScore(default_score));
        }

        let io_timeout_secs: u64 = parse_or(&lookup, "STORE_IO_TIMEOUT_SECS", 30)?;
        if io_timeout_secs == 0 {
            return Err(ConfigError::ZeroIoTimeout);
        }

        let paths = StorePaths {
            input: lookup("SRC_JSON_PATH").unwrap_or(defaults.input),
            snapshot: lookup("OUT_JSON_PATH").unwrap_or(defaults.snapshot),
            latest_delta: lookup("OUT_CHANGES_LATEST").unwrap_or(defaults.latest_delta),
            history_dir: lookup("OUT_CHANGES_HISTORY_DIR").unwrap_or(defaults.history_dir),
            state_index: lookup("OUT_STATE_INDEX").unwrap_or(defaults.state_index),
        };

        Ok(Self {
            thresholds,
            delta,
            default_score,
            max_retries: parse_or(&lookup, "PUBLISH_MAX_RETRIES", 3)?,
            io_timeout: Duration::from_secs(io_timeout_secs),
            paths,
            safe_prefix: lookup("SAFE_PATH_PREFIX").unwrap_or_else(|| "Data/safe".to_string()),
        })
    }

    /// Paths actually written, honoring safe mode.
    pub fn effective_paths(&self, safe: bool) -> StorePaths {
        if safe {
            self.paths.isolated(&self.safe_prefix)
        } else {
            self.paths.clone()
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            delta: DeltaPolicy::default(),
            default_score: 0.0,
            max_retries: 3,
            io_timeout: Duration::from_secs(30),
            paths: StorePaths::default(),
            safe_prefix: "Data/safe".to_string(),
        }
    }
}

fn parse_or<F, T>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value: raw,
        }),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.thresholds.suspicious(), 0.5);
        assert_eq!(config.thresholds.malicious(), 0.8);
        assert_eq!(config.delta.jump_threshold(), 0.2);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_overrides() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("THREAT_SCORE_THRESHOLD_SUSPICIOUS", "0.4"),
            ("PUBLISH_MAX_RETRIES", "5"),
            ("OUT_JSON_PATH", "out/graph.json"),
        ]))
        .unwrap();
        assert_eq!(config.thresholds.suspicious(), 0.4);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.paths.snapshot, "out/graph.json");
    }

    #[test]
    fn test_inverted_thresholds_rejected_at_load() {
        let err = PipelineConfig::from_lookup(lookup_from(&[
            ("THREAT_SCORE_THRESHOLD_SUSPICIOUS", "0.9"),
            ("THREAT_SCORE_THRESHOLD_MALICIOUS", "0.6"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThresholds { .. }));
    }

    #[test]
    fn test_unparseable_value() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("PUBLISH_MAX_RETRIES", "many")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue { var: "PUBLISH_MAX_RETRIES".into(), value: "many".into() }
        );
    }

    #[test]
    fn test_zero_io_timeout_rejected() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("STORE_IO_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroIoTimeout);

        let config = PipelineConfig::from_lookup(lookup_from(&[("STORE_IO_TIMEOUT_SECS", "1")])).unwrap();
        assert_eq!(config.io_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_safe_paths() {
        let config = PipelineConfig::default();
        let safe = config.effective_paths(true);
        assert_eq!(safe.snapshot, "Data/safe/Data/network_topology_scored.json");
        assert_eq!(safe.input, config.paths.input);
    }
}
