//! Node types for the scored topology graph.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Attribute keys owned by the pipeline.
///
/// These are never preserved from raw input: scores, statuses and versions
/// are always recomputed, never trusted from upstream.
pub const SCORED_FIELD_KEYS: &[&str] = &["threat_score", "status", "version", "updated_at"];

/// Keys tried, in order, to identify a raw input node.
pub const IDENTIFIER_KEYS: &[&str] = &["id", "hostname", "name", "ip_address", "IP"];

/// Unique identifier for a node within a snapshot.
///
/// Implements `Ord` so snapshots and change feeds can be ordered deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new NodeId.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier from a raw JSON value: a non-empty string or a number.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// Default grouping key for a node that arrives without one.
    pub fn default_network_id(&self) -> String {
        let prefix: String = self.0.chars().take(3).collect();
        format!("net_{}", prefix)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Status category derived from a threat score.
///
/// Ordered by severity: Benign < Suspicious < Malicious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Below the suspicious threshold.
    Benign,
    /// At or above the suspicious threshold, below malicious.
    Suspicious,
    /// At or above the malicious threshold.
    Malicious,
}

impl Default for Status {
    fn default() -> Self {
        Self::Benign
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Benign => write!(f, "benign"),
            Self::Suspicious => write!(f, "suspicious"),
            Self::Malicious => write!(f, "malicious"),
        }
    }
}

/// A node as read from the raw input graph, before scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputNode {
    /// Unique node identifier.
    pub id: NodeId,
    /// Network/cluster grouping key.
    pub network_id: String,
    /// Preserved attributes (everything except identity and scored fields).
    pub attributes: BTreeMap<String, Value>,
}

impl InputNode {
    /// Create a new input node.
    pub fn new(id: impl Into<NodeId>, network_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            network_id: network_id.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Scored fields compared between snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredFields {
    /// Threat score [0, 1].
    pub threat_score: f64,
    /// Status category.
    pub status: Status,
    /// Node version at the time these fields were observed.
    pub version: u64,
}

/// A scored node as published in a snapshot.
///
/// Preserved attributes are flattened into the node object so consumers see
/// the same shape as the raw input plus the scored fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredNode {
    /// Unique node identifier.
    pub id: NodeId,
    /// Network/cluster grouping key.
    pub network_id: String,
    /// Preserved attributes.
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
    /// Threat score [0, 1].
    pub threat_score: f64,
    /// Status category.
    pub status: Status,
    /// Version counter owned by the delta computator.
    #[serde(default)]
    pub version: u64,
    /// Last time a scored field changed.
    #[serde(default = "epoch")]
    pub updated_at: DateTime<Utc>,
}

impl ScoredNode {
    /// Build a freshly scored node from an input node.
    ///
    /// Version and timestamp are placeholders until the delta computator
    /// assigns them against the previously published snapshot.
    pub fn from_input(input: InputNode, threat_score: f64, status: Status) -> Self {
        Self {
            id: input.id,
            network_id: input.network_id,
            attributes: input.attributes,
            threat_score,
            status,
            version: 0,
            updated_at: epoch(),
        }
    }

    /// Get the scored fields of this node.
    pub fn scored_fields(&self) -> ScoredFields {
        ScoredFields {
            threat_score: self.threat_score,
            status: self.status,
            version: self.version,
        }
    }
}

/// Unix epoch, used when a stored node carries no timestamp.
pub(crate) fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}
