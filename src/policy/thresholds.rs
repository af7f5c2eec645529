//! Score thresholds: status classification and jump detection.
//!
//! ## Float Normalization
//!
//! Scores are compared after quantization to 1e-6 (see
//! [`crate::canonical::quantize`]), the same normalization used for content
//! hashing. A score that lands exactly on a threshold belongs to the
//! higher-severity bucket.

use serde::{Deserialize, Serialize};

use crate::canonical::quantize;
use crate::config::ConfigError;
use crate::types::Status;

/// Default score at or above which a node is suspicious.
pub const DEFAULT_SUSPICIOUS_THRESHOLD: f64 = 0.5;
/// Default score at or above which a node is malicious.
pub const DEFAULT_MALICIOUS_THRESHOLD: f64 = 0.8;
/// Default minimum score movement reported as a score jump.
pub const DEFAULT_JUMP_THRESHOLD: f64 = 0.2;

/// Status classification thresholds.
///
/// Invariant: `0 <= suspicious < malicious <= 1`, enforced by [`Thresholds::new`]
/// and on deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawThresholds")]
pub struct Thresholds {
    suspicious: f64,
    malicious: f64,
}

#[derive(Deserialize)]
struct RawThresholds {
    suspicious: f64,
    malicious: f64,
}

impl TryFrom<RawThresholds> for Thresholds {
    type Error = ConfigError;

    fn try_from(raw: RawThresholds) -> Result<Self, Self::Error> {
        Self::new(raw.suspicious, raw.malicious)
    }
}

impl Thresholds {
    /// Create validated thresholds.
    pub fn new(suspicious: f64, malicious: f64) -> Result<Self, ConfigError> {
        let in_range = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_range(suspicious) || !in_range(malicious) || suspicious >= malicious {
            return Err(ConfigError::InvalidThresholds { suspicious, malicious });
        }
        Ok(Self { suspicious, malicious })
    }

    /// Score at or above which a node is suspicious.
    pub fn suspicious(&self) -> f64 {
        self.suspicious
    }

    /// Score at or above which a node is malicious.
    pub fn malicious(&self) -> f64 {
        self.malicious
    }

    /// Map a score to its status category.
    pub fn classify(&self, score: f64) -> Status {
        let q = quantize(score);
        if q >= quantize(self.malicious) {
            Status::Malicious
        } else if q >= quantize(self.suspicious) {
            Status::Suspicious
        } else {
            Status::Benign
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            suspicious: DEFAULT_SUSPICIOUS_THRESHOLD,
            malicious: DEFAULT_MALICIOUS_THRESHOLD,
        }
    }
}

/// Free-function form of [`Thresholds::classify`].
pub fn classify(score: f64, thresholds: &Thresholds) -> Status {
    thresholds.classify(score)
}

/// Change detection policy for the delta computator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDeltaPolicy")]
pub struct DeltaPolicy {
    jump_threshold: f64,
}

#[derive(Deserialize)]
struct RawDeltaPolicy {
    jump_threshold: f64,
}

impl TryFrom<RawDeltaPolicy> for DeltaPolicy {
    type Error = ConfigError;

    fn try_from(raw: RawDeltaPolicy) -> Result<Self, Self::Error> {
        Self::new(raw.jump_threshold)
    }
}

impl DeltaPolicy {
    /// Create a validated policy. The jump threshold must be in (0, 1].
    pub fn new(jump_threshold: f64) -> Result<Self, ConfigError> {
        if !jump_threshold.is_finite() || jump_threshold <= 0.0 || jump_threshold > 1.0 {
            return Err(ConfigError::InvalidJumpThreshold(jump_threshold));
        }
        Ok(Self { jump_threshold })
    }

    /// Minimum absolute score movement reported as a jump.
    pub fn jump_threshold(&self) -> f64 {
        self.jump_threshold
    }

    /// True if the move from `prev` to `curr` is at least the jump threshold.
    pub fn is_jump(&self, prev: f64, curr: f64) -> bool {
        (quantize(curr) - quantize(prev)).abs() >= quantize(self.jump_threshold)
    }
}

impl Default for DeltaPolicy {
    fn default() -> Self {
        Self {
            jump_threshold: DEFAULT_JUMP_THRESHOLD,
        }
    }
}
