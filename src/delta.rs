//! Delta computator.
//!
//! Compares the freshly scored snapshot against the previously published one
//! and produces the ordered change feed plus the snapshot to publish, with
//! versions and timestamps assigned.
//!
//! ## Algorithm
//!
//! 1. Index previous nodes by id (empty on a bootstrap run)
//! 2. For each current node:
//!    - absent before: `created`, version 1
//!    - status differs: `status_change`, version + 1
//!    - same status, |Δscore| ≥ jump threshold: `score_jump`, version + 1
//!    - otherwise: no record, previous version and timestamp carried forward
//! 3. Each previous node absent now: `removed`, dropped from the snapshot
//! 4. Sort records by [`feed_order`], assign `seq` 1..=n
//!
//! Versions present on the current snapshot are ignored; they are owned here.

use std::collections::BTreeMap;

use crate::policy::{feed_order, DeltaPolicy};
use crate::types::{
    ChangeReason, ChangeRecord, DeltaFeed, EntityKind, NodeId, RunStamp, ScoredNode, Snapshot,
};

/// Result of one diff.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffOutcome {
    /// Ordered change feed.
    pub feed: DeltaFeed,
    /// Snapshot to publish, versions assigned.
    pub snapshot: Snapshot,
}

/// Computes deltas between consecutive snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaComputator {
    policy: DeltaPolicy,
}

impl DeltaComputator {
    /// Create a computator with the given policy.
    pub fn new(policy: DeltaPolicy) -> Self {
        Self { policy }
    }

    /// Change detection policy.
    pub fn policy(&self) -> &DeltaPolicy {
        &self.policy
    }

    /// Diff `curr` against `prev` (`None` on a bootstrap run).
    pub fn diff(&self, prev: Option<&Snapshot>, curr: &Snapshot, stamp: &RunStamp) -> DiffOutcome {
        let index: BTreeMap<&NodeId, &ScoredNode> = prev
            .map(|s| s.nodes.iter().map(|n| (&n.id, n)).collect())
            .unwrap_or_default();

        let mut changes = Vec::new();
        let mut nodes = Vec::with_capacity(curr.nodes.len());

        for node in &curr.nodes {
            let mut next = node.clone();

            let reason = match index.get(&node.id) {
                None => {
                    next.version = 1;
                    Some(ChangeReason::Created)
                }
                Some(before) => {
                    let reason = if before.status != node.status {
                        Some(ChangeReason::StatusChange)
                    } else if self.policy.is_jump(before.threat_score, node.threat_score) {
                        Some(ChangeReason::ScoreJump)
                    } else {
                        None
                    };
                    next.version = if reason.is_some() { before.version + 1 } else { before.version };
                    reason
                }
            };

            match reason {
                Some(reason) => {
                    next.updated_at = stamp.generated_at;
                    let prev_fields = index.get(&node.id).map(|b| b.scored_fields());
                    changes.push(ChangeRecord {
                        entity: EntityKind::Node,
                        id: next.id.clone(),
                        network_id: next.network_id.clone(),
                        prev: prev_fields,
                        curr: Some(next.scored_fields()),
                        threshold_crossed: reason != ChangeReason::ScoreJump,
                        reason,
                        version: next.version,
                        updated_at: stamp.generated_at,
                        seq: 0,
                    });
                }
                None => {
                    if let Some(before) = index.get(&node.id) {
                        next.updated_at = before.updated_at;
                    }
                }
            }

            nodes.push(next);
        }

        let current_ids: std::collections::BTreeSet<&NodeId> = curr.nodes.iter().map(|n| &n.id).collect();
        for (id, before) in &index {
            if current_ids.contains(id) {
                continue;
            }
            changes.push(ChangeRecord {
                entity: EntityKind::Node,
                id: before.id.clone(),
                network_id: before.network_id.clone(),
                prev: Some(before.scored_fields()),
                curr: None,
                threshold_crossed: true,
                reason: ChangeReason::Removed,
                version: before.version,
                updated_at: stamp.generated_at,
                seq: 0,
            });
        }

        changes.sort_by(feed_order);
        for (i, change) in changes.iter_mut().enumerate() {
            change.seq = i as u64 + 1;
        }

        let snapshot = Snapshot::new(nodes, curr.edges.clone(), stamp.generated_at);
        let event_seq = changes.len() as u64;

        tracing::debug!(
            run_id = %stamp.run_id,
            bootstrap = prev.is_none(),
            changes = changes.len(),
            crossings = changes.iter().filter(|c| c.threshold_crossed).count(),
            "Computed delta"
        );

        DiffOutcome {
            feed: DeltaFeed {
                run_id: stamp.run_id.clone(),
                snapshot_id: snapshot.content_id(),
                generated_at: stamp.generated_at,
                changes,
                event_seq,
            },
            snapshot,
        }
    }
}
