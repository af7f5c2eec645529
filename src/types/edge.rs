//! Edge types for the topology graph.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

use super::node::NodeId;

/// Keys naming an edge's source, in lookup order.
pub const SOURCE_KEYS: &[&str] = &["source", "from"];

/// Keys naming an edge's target, in lookup order.
pub const TARGET_KEYS: &[&str] = &["target", "to"];

/// Edge between two nodes.
///
/// Edges are supporting data: they are not scored and are published
/// verbatim. `fields` holds the edge object exactly as read, endpoint keys
/// included; `source` and `target` are resolved from it with the same
/// string-or-number rule as node identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Resolved source node.
    pub source: NodeId,
    /// Resolved target node.
    pub target: NodeId,
    /// The edge object as published.
    pub fields: BTreeMap<String, Value>,
}

impl Edge {
    /// Create an edge `{"source": .., "target": ..}`.
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        let source = source.into();
        let target = target.into();
        let mut fields = BTreeMap::new();
        fields.insert("source".to_string(), Value::String(source.as_str().to_string()));
        fields.insert("target".to_string(), Value::String(target.as_str().to_string()));
        Self { source, target, fields }
    }

    /// Add a field.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Resolve the endpoints of a raw edge object.
    pub fn from_fields(fields: BTreeMap<String, Value>) -> Result<Self, String> {
        let source = endpoint(&fields, SOURCE_KEYS).ok_or("edge has no source")?;
        let target = endpoint(&fields, TARGET_KEYS).ok_or("edge has no target")?;
        Ok(Self { source, target, fields })
    }
}

fn endpoint(fields: &BTreeMap<String, Value>, keys: &[&str]) -> Option<NodeId> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find_map(NodeId::from_json)
}

impl Serialize for Edge {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Edge {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Self::from_fields(fields).map_err(de::Error::custom)
    }
}
