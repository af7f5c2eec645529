//! Scorer adapter.
//!
//! Wraps an external [`Scorer`] and makes scoring total over the input set:
//! a batch failure, a missing entry or an invalid score degrades that node to
//! the configured default score and records a [`ScoringWarning`]. A run is
//! never aborted by the model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::ConfigError;
use crate::policy::Thresholds;
use crate::types::{InputGraph, InputNode, NodeId, ScoredNode, Snapshot};

/// Error type for scorer implementations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoreError {
    /// The model could not produce scores for this batch.
    #[error("Scoring model failed: {0}")]
    Model(String),
}

/// A threat model.
///
/// Maps node features to a score in [0, 1]. Implementations are pure: the
/// input is borrowed and the same input yields the same output.
pub trait Scorer: Send + Sync {
    /// Model name, used in logs.
    fn name(&self) -> &str;

    /// Score a batch of nodes.
    ///
    /// The result may omit nodes or contain invalid values; the adapter
    /// degrades those individually.
    fn score(&self, nodes: &BTreeMap<NodeId, InputNode>) -> Result<BTreeMap<NodeId, f64>, ScoreError>;
}

/// Why a node was scored with the default score.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DegradeReason {
    /// The whole batch failed.
    BatchFailed {
        /// Model error message.
        error: String,
    },
    /// The model returned no score for this node.
    Missing,
    /// The model returned NaN, an infinity or a value outside [0, 1].
    Invalid {
        /// The rejected value.
        value: f64,
    },
}

impl fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatchFailed { error } => write!(f, "batch failed: {}", error),
            Self::Missing => write!(f, "no score returned"),
            Self::Invalid { value } => write!(f, "invalid score {}", value),
        }
    }
}

/// Non-fatal per-node scoring failure (`ScoringDegraded`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoringWarning {
    /// Affected node.
    pub node_id: NodeId,
    /// What went wrong.
    #[serde(flatten)]
    pub reason: DegradeReason,
    /// Score substituted for the node.
    pub substituted: f64,
}

impl ScoringWarning {
    /// Taxonomy name of this warning.
    pub fn kind(&self) -> &'static str {
        "ScoringDegraded"
    }
}

/// Scores for every input node plus the degradations that produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoringReport {
    /// One score per input node, all in [0, 1].
    pub scores: BTreeMap<NodeId, f64>,
    /// Nodes that fell back to the default score, ordered by node id.
    pub warnings: Vec<ScoringWarning>,
}

/// Scored snapshot produced from an input graph.
///
/// Versions and timestamps are placeholders until the delta computator
/// assigns them.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredGraph {
    /// Current scored snapshot.
    pub snapshot: Snapshot,
    /// Scoring degradations.
    pub warnings: Vec<ScoringWarning>,
}

/// Makes a [`Scorer`] total and classifies its output.
#[derive(Clone)]
pub struct ScorerAdapter {
    scorer: Arc<dyn Scorer>,
    thresholds: Thresholds,
    default_score: f64,
}

impl fmt::Debug for ScorerAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScorerAdapter")
            .field("scorer", &self.scorer.name())
            .field("thresholds", &self.thresholds)
            .field("default_score", &self.default_score)
            .finish()
    }
}

impl ScorerAdapter {
    /// Create an adapter. `default_score` must lie in [0, 1].
    pub fn new(scorer: Arc<dyn Scorer>, thresholds: Thresholds, default_score: f64) -> Result<Self, ConfigError> {
        if !default_score.is_finite() || !(0.0..=1.0).contains(&default_score) {
            return Err(ConfigError::InvalidDefaultScore(default_score));
        }
        Ok(Self { scorer, thresholds, default_score })
    }

    /// Thresholds used for classification.
    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Score substituted on degradation.
    pub fn default_score(&self) -> f64 {
        self.default_score
    }

    /// Score every node. Total: each input node gets exactly one score.
    pub fn score_all(&self, nodes: &[InputNode]) -> ScoringReport {
        let batch: BTreeMap<NodeId, InputNode> = nodes
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();

        let mut report = ScoringReport::default();

        let raw = match self.scorer.score(&batch) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    scorer = %self.scorer.name(),
                    nodes = batch.len(),
                    error = %e,
                    "Scoring batch failed, substituting default score"
                );
                let reason = DegradeReason::BatchFailed { error: e.to_string() };
                for id in batch.keys() {
                    report.scores.insert(id.clone(), self.default_score);
                    report.warnings.push(self.warning(id, reason.clone()));
                }
                return report;
            }
        };

        for id in batch.keys() {
            let score = match raw.get(id) {
                Some(&v) if v.is_finite() && (0.0..=1.0).contains(&v) => v,
                Some(&v) => {
                    tracing::warn!(node_id = %id, value = v, "Invalid score, substituting default");
                    report.warnings.push(self.warning(id, DegradeReason::Invalid { value: v }));
                    self.default_score
                }
                None => {
                    tracing::warn!(node_id = %id, "Missing score, substituting default");
                    report.warnings.push(self.warning(id, DegradeReason::Missing));
                    self.default_score
                }
            };
            report.scores.insert(id.clone(), score);
        }

        report
    }

    /// Score an input graph into the current snapshot.
    pub fn score_graph(&self, graph: InputGraph, generated_at: DateTime<Utc>) -> ScoredGraph {
        let ScoringReport { scores, warnings } = self.score_all(&graph.nodes);

        let nodes = graph
            .nodes
            .into_iter()
            .map(|input| {
                let score = scores.get(&input.id).copied().unwrap_or(self.default_score);
                let status = self.thresholds.classify(score);
                ScoredNode::from_input(input, score, status)
            })
            .collect();

        tracing::debug!(
            scorer = %self.scorer.name(),
            degraded = warnings.len(),
            "Scored input graph"
        );

        ScoredGraph {
            snapshot: Snapshot::new(nodes, graph.edges, generated_at),
            warnings,
        }
    }

    fn warning(&self, id: &NodeId, reason: DegradeReason) -> ScoringWarning {
        ScoringWarning {
            node_id: id.clone(),
            reason,
            substituted: self.default_score,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scorers
// ─────────────────────────────────────────────────────────────────────────────

/// Placeholder model keyed on the node identifier.
///
/// Takes the last two alphanumeric characters of the id, reads them as hex
/// if either is a letter and as decimal otherwise, and scores
/// `(value % 100) / 100`. Characters that do not parse fall back to the sum
/// of their code points.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifierTailScorer;

impl IdentifierTailScorer {
    /// Score a single identifier.
    pub fn score_id(id: &str) -> f64 {
        let alnum: Vec<char> = id.chars().filter(|c| c.is_alphanumeric()).collect();
        let tail: String = if alnum.is_empty() {
            "00".to_string()
        } else {
            alnum[alnum.len().saturating_sub(2)..].iter().collect()
        };

        let radix = if tail.chars().any(char::is_alphabetic) { 16 } else { 10 };
        let value = u64::from_str_radix(&tail, radix)
            .unwrap_or_else(|_| tail.chars().map(|c| c as u64).sum());

        (value % 100) as f64 / 100.0
    }
}

impl Scorer for IdentifierTailScorer {
    fn name(&self) -> &str {
        "identifier-tail"
    }

    fn score(&self, nodes: &BTreeMap<NodeId, InputNode>) -> Result<BTreeMap<NodeId, f64>, ScoreError> {
        Ok(nodes
            .keys()
            .map(|id| (id.clone(), Self::score_id(id.as_str())))
            .collect())
    }
}

/// Fixed scores by node id. Nodes without an entry are left unscored.
#[derive(Debug, Clone, Default)]
pub struct StaticScorer {
    scores: BTreeMap<NodeId, f64>,
}

impl StaticScorer {
    /// Create an empty static scorer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the score of a node.
    pub fn with_score(mut self, id: impl Into<NodeId>, score: f64) -> Self {
        self.scores.insert(id.into(), score);
        self
    }
}

impl<I: Into<NodeId>> FromIterator<(I, f64)> for StaticScorer {
    fn from_iter<T: IntoIterator<Item = (I, f64)>>(iter: T) -> Self {
        Self {
            scores: iter.into_iter().map(|(id, s)| (id.into(), s)).collect(),
        }
    }
}

impl Scorer for StaticScorer {
    fn name(&self) -> &str {
        "static"
    }

    fn score(&self, nodes: &BTreeMap<NodeId, InputNode>) -> Result<BTreeMap<NodeId, f64>, ScoreError> {
        Ok(nodes
            .keys()
            .filter_map(|id| self.scores.get(id).map(|s| (id.clone(), *s)))
            .collect())
    }
}

/// Scorer backed by a closure.
pub struct FnScorer<F> {
    name: String,
    f: F,
}

impl<F> FnScorer<F>
where
    F: Fn(&BTreeMap<NodeId, InputNode>) -> Result<BTreeMap<NodeId, f64>, ScoreError> + Send + Sync,
{
    /// Wrap a closure as a named scorer.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Scorer for FnScorer<F>
where
    F: Fn(&BTreeMap<NodeId, InputNode>) -> Result<BTreeMap<NodeId, f64>, ScoreError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, nodes: &BTreeMap<NodeId, InputNode>) -> Result<BTreeMap<NodeId, f64>, ScoreError> {
        (self.f)(nodes)
    }
}
