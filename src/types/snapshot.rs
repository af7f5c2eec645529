//! Input graphs and published snapshots.
//!
//! The raw input graph and the published snapshot are different objects:
//! input is unscored topology data, a snapshot is the scored output of a run.
//!
//! ## Content Identity
//!
//! A snapshot's `content_id` is the SHA-256 of its canonical bytes:
//! - Nodes sorted by id, edges sorted by (source, target, fields)
//! - Attribute maps with sorted keys and normalized numbers
//! - Scores quantized to i64 (factor 1e6)
//! - Timestamps excluded, so identical content from different runs hashes identically

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::canonical::{normalize_value, quantize, sha256_hex, to_canonical_bytes};
use crate::SNAPSHOT_SCHEMA_VERSION;
use super::edge::Edge;
use super::node::{InputNode, NodeId, ScoredNode, Status, IDENTIFIER_KEYS, SCORED_FIELD_KEYS};

/// Error type for graph parsing and validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// The raw bytes could not be parsed into a graph.
    #[error("Malformed input: {0}")]
    MalformedInput(String),
    /// The graph parsed but violates structural invariants.
    #[error("Schema violation: {}", join_violations(.0))]
    SchemaViolation(Vec<SchemaViolation>),
}

impl From<serde_json::Error> for GraphError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedInput(e.to_string())
    }
}

/// A single structural violation found during validation.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaViolation {
    /// The same node id appears more than once.
    DuplicateNode(NodeId),
    /// An edge references a node id that is not in the node set.
    UnknownEdgeEndpoint {
        /// Edge source.
        source: NodeId,
        /// Edge target.
        target: NodeId,
        /// The endpoint that does not exist.
        missing: NodeId,
    },
    /// A score is NaN or outside [0, 1].
    ScoreOutOfRange {
        /// Offending node.
        node: NodeId,
        /// Offending score.
        score: f64,
    },
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNode(id) => write!(f, "duplicate node id {}", id),
            Self::UnknownEdgeEndpoint { source, target, missing } => {
                write!(f, "edge {} -> {} references unknown node {}", source, target, missing)
            }
            Self::ScoreOutOfRange { node, score } => {
                write!(f, "node {} has score {} outside [0, 1]", node, score)
            }
        }
    }
}

fn join_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Check id uniqueness and edge endpoints.
fn structural_violations<'a>(
    ids: impl Iterator<Item = &'a NodeId>,
    edges: &[Edge],
) -> Vec<SchemaViolation> {
    let mut violations = Vec::new();
    let mut seen: BTreeSet<&NodeId> = BTreeSet::new();

    for id in ids {
        if !seen.insert(id) {
            violations.push(SchemaViolation::DuplicateNode(id.clone()));
        }
    }

    for edge in edges {
        for endpoint in [&edge.source, &edge.target] {
            if !seen.contains(endpoint) {
                violations.push(SchemaViolation::UnknownEdgeEndpoint {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
    }

    violations
}

fn into_result(violations: Vec<SchemaViolation>) -> Result<(), GraphError> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(GraphError::SchemaViolation(violations))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Input graph
// ─────────────────────────────────────────────────────────────────────────────

/// Raw, unscored input graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputGraph {
    /// Input nodes in source order.
    pub nodes: Vec<InputNode>,
    /// Edges, carried verbatim into the published snapshot.
    pub edges: Vec<Edge>,
}

impl InputGraph {
    /// Create an input graph from nodes and edges.
    pub fn new(nodes: Vec<InputNode>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Parse a raw topology document.
    ///
    /// Nodes are identified by the first non-empty of `id`, `hostname`,
    /// `name`, `ip_address`, `IP`. Nodes without `network_id` get
    /// `net_<first three characters of id>`. Scored fields present in the
    /// input are discarded.
    pub fn parse(raw: &[u8]) -> Result<Self, GraphError> {
        let doc: Value = serde_json::from_slice(raw)?;
        let obj = doc
            .as_object()
            .ok_or_else(|| GraphError::MalformedInput("top-level value is not an object".into()))?;

        let nodes = match obj.get("nodes") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(index, item)| parse_input_node(index, item))
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(GraphError::MalformedInput("`nodes` is not an array".into())),
        };

        let edges = match obj.get("edges") {
            None | Some(Value::Null) => Vec::new(),
            Some(value @ Value::Array(_)) => Vec::<Edge>::deserialize(value)
                .map_err(|e| GraphError::MalformedInput(format!("invalid edge: {}", e)))?,
            Some(_) => return Err(GraphError::MalformedInput("`edges` is not an array".into())),
        };

        Ok(Self { nodes, edges })
    }

    /// Validate node uniqueness and edge endpoints.
    pub fn validate(&self) -> Result<(), GraphError> {
        into_result(structural_violations(
            self.nodes.iter().map(|n| &n.id),
            &self.edges,
        ))
    }
}

fn parse_input_node(index: usize, item: &Value) -> Result<InputNode, GraphError> {
    let obj = item.as_object().ok_or_else(|| {
        GraphError::MalformedInput(format!("node at index {} is not an object", index))
    })?;

    let id = IDENTIFIER_KEYS
        .iter()
        .filter_map(|key| obj.get(*key))
        .find_map(NodeId::from_json)
        .ok_or_else(|| {
            GraphError::MalformedInput(format!("node at index {} has no identifier", index))
        })?;

    let network_id = obj
        .get("network_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| id.default_network_id());

    let attributes = obj
        .iter()
        .filter(|(key, _)| {
            key.as_str() != "id" && key.as_str() != "network_id" && !SCORED_FIELD_KEYS.contains(&key.as_str())
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(InputNode { id, network_id, attributes })
}

// ─────────────────────────────────────────────────────────────────────────────
// Published snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Content-derived identifier of a snapshot (SHA-256 hex of canonical bytes).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Full scored graph state at a point in time.
///
/// Published schema: `{ nodes, edges, updated_at }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Scored nodes, ordered by id.
    pub nodes: Vec<ScoredNode>,
    /// Edges in input order.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// When this snapshot was produced.
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    /// Create a snapshot. Nodes are sorted by id.
    pub fn new(mut nodes: Vec<ScoredNode>, edges: Vec<Edge>, updated_at: DateTime<Utc>) -> Self {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Self { nodes, edges, updated_at }
    }

    /// Parse a published snapshot.
    pub fn parse(raw: &[u8]) -> Result<Self, GraphError> {
        let mut snapshot: Snapshot = serde_json::from_slice(raw)?;
        snapshot.nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshot)
    }

    /// Validate uniqueness, edge endpoints and score range.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut violations = structural_violations(self.nodes.iter().map(|n| &n.id), &self.edges);

        for node in &self.nodes {
            if !(0.0..=1.0).contains(&node.threat_score) {
                violations.push(SchemaViolation::ScoreOutOfRange {
                    node: node.id.clone(),
                    score: node.threat_score,
                });
            }
        }

        into_result(violations)
    }

    /// Deterministic serialization used as the input of content hashing.
    pub fn canonicalize(&self) -> Vec<u8> {
        let mut nodes: Vec<CanonicalNode<'_>> = self
            .nodes
            .iter()
            .map(|n| CanonicalNode {
                id: &n.id,
                network_id: &n.network_id,
                attributes: canonical_attributes(&n.attributes),
                threat_score: quantize(n.threat_score),
                status: n.status,
                version: n.version,
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(b.id));

        let mut edges: Vec<CanonicalEdge<'_>> = self
            .edges
            .iter()
            .map(|e| CanonicalEdge {
                source: &e.source,
                target: &e.target,
                fields: canonical_attributes(&e.fields),
            })
            .collect();
        edges.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        to_canonical_bytes(&CanonicalSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            nodes,
            edges,
        })
    }

    /// Content-derived identifier.
    pub fn content_id(&self) -> SnapshotId {
        SnapshotId(sha256_hex(&self.canonicalize()))
    }

    /// Look up a node by id.
    pub fn node(&self, id: &NodeId) -> Option<&ScoredNode> {
        self.nodes
            .binary_search_by(|n| n.id.cmp(id))
            .ok()
            .map(|i| &self.nodes[i])
    }

    /// Number of nodes with the given status.
    pub fn count_status(&self, status: Status) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Serialize for publication: pretty JSON with a trailing newline.
    pub fn to_published_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        published_bytes(self)
    }
}

/// Pretty JSON with a trailing newline, the format of every published object.
pub(crate) fn published_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn canonical_attributes(attributes: &BTreeMap<String, Value>) -> Value {
    Value::Object(
        attributes
            .iter()
            .map(|(k, v)| (k.clone(), normalize_value(v)))
            .collect(),
    )
}

#[derive(Serialize)]
struct CanonicalSnapshot<'a> {
    schema_version: &'static str,
    nodes: Vec<CanonicalNode<'a>>,
    edges: Vec<CanonicalEdge<'a>>,
}

#[derive(Serialize)]
struct CanonicalNode<'a> {
    id: &'a NodeId,
    network_id: &'a str,
    attributes: Value,
    threat_score: i64,
    status: Status,
    version: u64,
}

#[derive(Serialize)]
struct CanonicalEdge<'a> {
    source: &'a NodeId,
    target: &'a NodeId,
    fields: Value,
}

impl CanonicalEdge<'_> {
    fn sort_key(&self) -> (&NodeId, &NodeId, String) {
        (self.source, self.target, self.fields.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::node::epoch;
    use serde_json::json;

    fn scored(id: &str, score: f64, status: Status, version: u64) -> ScoredNode {
        let mut node = ScoredNode::from_input(InputNode::new(id, "net_a"), score, status);
        node.version = version;
        node
    }

    #[test]
    fn test_parse_identifier_fallback() {
        let raw = br#"{"nodes":[
            {"hostname":"web-01","os":"linux"},
            {"ip_address":"10.0.0.5","network_id":"dmz"}
        ],"edges":[{"source":"web-01","target":"10.0.0.5"}]}"#;
        let graph = InputGraph::parse(raw).unwrap();

        assert_eq!(graph.nodes[0].id.as_str(), "web-01");
        assert_eq!(graph.nodes[0].network_id, "net_web");
        assert_eq!(graph.nodes[1].id.as_str(), "10.0.0.5");
        assert_eq!(graph.nodes[1].network_id, "dmz");
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_parse_discards_untrusted_scored_fields() {
        let raw = br#"{"nodes":[{"id":"n1","threat_score":0.99,"status":"malicious","version":42,"role":"db"}]}"#;
        let graph = InputGraph::parse(raw).unwrap();
        let attrs = &graph.nodes[0].attributes;

        assert!(!attrs.contains_key("threat_score"));
        assert!(!attrs.contains_key("version"));
        assert!(!attrs.contains_key("status"));
        assert_eq!(attrs.get("role"), Some(&json!("db")));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(InputGraph::parse(b"not json"), Err(GraphError::MalformedInput(_))));
        assert!(matches!(InputGraph::parse(b"[]"), Err(GraphError::MalformedInput(_))));
        assert!(matches!(
            InputGraph::parse(br#"{"nodes":[{"os":"linux"}]}"#),
            Err(GraphError::MalformedInput(_))
        ));
        assert!(matches!(
            InputGraph::parse(br#"{"nodes":{}}"#),
            Err(GraphError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_validate_duplicates_and_dangling_edges() {
        let graph = InputGraph::new(
            vec![InputNode::new("a", "n"), InputNode::new("a", "n")],
            vec![Edge::new("a", "ghost")],
        );
        match graph.validate() {
            Err(GraphError::SchemaViolation(v)) => {
                assert_eq!(v.len(), 2);
                assert_eq!(v[0], SchemaViolation::DuplicateNode(NodeId::new("a")));
                assert!(matches!(&v[1], SchemaViolation::UnknownEdgeEndpoint { missing, .. } if missing.as_str() == "ghost"));
            }
            other => panic!("expected schema violation, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_score_range() {
        let snapshot = Snapshot::new(vec![scored("a", 1.5, Status::Malicious, 1)], vec![], epoch());
        assert!(matches!(snapshot.validate(), Err(GraphError::SchemaViolation(_))));

        let nan = Snapshot::new(vec![scored("a", f64::NAN, Status::Benign, 1)], vec![], epoch());
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_content_id_ignores_order_and_timestamps() {
        let a = Snapshot::new(
            vec![scored("a", 0.1, Status::Benign, 1), scored("b", 0.9, Status::Malicious, 2)],
            vec![Edge::new("a", "b"), Edge::new("b", "a")],
            epoch(),
        );
        let mut b = Snapshot {
            nodes: vec![scored("b", 0.9, Status::Malicious, 2), scored("a", 0.1, Status::Benign, 1)],
            edges: vec![Edge::new("b", "a"), Edge::new("a", "b")],
            updated_at: Utc::now(),
        };
        b.nodes[0].updated_at = Utc::now();

        assert_eq!(a.canonicalize(), b.canonicalize());
        assert_eq!(a.content_id(), b.content_id());
    }

    #[test]
    fn test_content_id_changes_with_scored_fields() {
        let a = Snapshot::new(vec![scored("a", 0.1, Status::Benign, 1)], vec![], epoch());
        let b = Snapshot::new(vec![scored("a", 0.1, Status::Benign, 2)], vec![], epoch());
        assert_ne!(a.content_id(), b.content_id());
    }

    #[test]
    fn test_published_round_trip() {
        let snapshot = Snapshot::new(
            vec![scored("a", 0.25, Status::Benign, 3)],
            vec![Edge::new("a", "a").with_attribute("weight", json!(2))],
            Utc::now(),
        );
        let bytes = snapshot.to_published_bytes().unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));

        let parsed = Snapshot::parse(&bytes).unwrap();
        assert_eq!(parsed, snapshot);
        assert_eq!(parsed.node(&NodeId::new("a")).map(|n| n.version), Some(3));
    }

    #[test]
    fn test_numeric_ids_and_endpoints() {
        let raw = br#"{"nodes":[{"id":1},{"id":2}],"edges":[{"source":1,"target":2}]}"#;
        let graph = InputGraph::parse(raw).unwrap();

        assert_eq!(graph.nodes[0].id.as_str(), "1");
        assert_eq!(graph.edges[0].source.as_str(), "1");
        assert_eq!(graph.edges[0].target.as_str(), "2");
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_edges_published_verbatim() {
        let raw = br#"{"nodes":[{"id":"a"},{"id":"b"}],"edges":[
            {"from":"a","to":"b","protocol":"tcp"},
            {"source":"b","target":"a","weight":3}
        ]}"#;
        let graph = InputGraph::parse(raw).unwrap();
        let snapshot = Snapshot::new(vec![], graph.edges, epoch());

        let published: Value = serde_json::from_slice(&snapshot.to_published_bytes().unwrap()).unwrap();
        assert_eq!(
            published["edges"],
            json!([
                {"from": "a", "to": "b", "protocol": "tcp"},
                {"source": "b", "target": "a", "weight": 3}
            ])
        );
    }
}
