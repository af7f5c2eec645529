//! Change records, delta feeds and the state index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::node::{NodeId, ScoredFields, Status};
use super::snapshot::{published_bytes, SnapshotId};

/// Identifier of a pipeline run.
///
/// Derived from the run's wall-clock start (`%Y-%m-%dT%H-%M-%SZ`) plus a
/// random suffix, so runs started within the same second do not collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a run id for a run started at `started_at`.
    pub fn generate(started_at: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", started_at.format("%Y-%m-%dT%H-%M-%SZ"), &suffix[..8]))
    }

    /// Wrap an existing run id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id used by a publish attempt that had to re-diff after `retry` conflicts.
    ///
    /// Retry 0 is the run id itself.
    pub fn for_retry(&self, retry: u32) -> Self {
        if retry == 0 {
            self.clone()
        } else {
            Self(format!("{}-r{}", self.0, retry))
        }
    }

    /// Borrow as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run identity and generation time stamped onto every artifact of one diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStamp {
    /// Run identifier.
    pub run_id: RunId,
    /// Generation timestamp; also the `updated_at` of changed nodes.
    pub generated_at: DateTime<Utc>,
}

impl RunStamp {
    /// Create a new run stamp.
    pub fn new(run_id: RunId, generated_at: DateTime<Utc>) -> Self {
        Self { run_id, generated_at }
    }
}

/// Kind of entity a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A graph node.
    Node,
}

/// Why a change record was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// Status category differs from the previous snapshot.
    StatusChange,
    /// Same status, score moved by at least the jump threshold.
    ScoreJump,
    /// Node absent from the previous snapshot.
    Created,
    /// Node absent from the current snapshot.
    Removed,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusChange => write!(f, "status_change"),
            Self::ScoreJump => write!(f, "score_jump"),
            Self::Created => write!(f, "created"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// One per-node change between two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Entity kind (always `node` in the current scope).
    pub entity: EntityKind,
    /// Node id.
    pub id: NodeId,
    /// Grouping key.
    pub network_id: String,
    /// Scored fields before the change (absent for created nodes).
    pub prev: Option<ScoredFields>,
    /// Scored fields after the change (absent for removed nodes).
    pub curr: Option<ScoredFields>,
    /// True on a status category transition, creation or removal.
    pub threshold_crossed: bool,
    /// Reason tag.
    pub reason: ChangeReason,
    /// Node version after this change.
    pub version: u64,
    /// Timestamp of this change.
    pub updated_at: DateTime<Utc>,
    /// Event sequence number within the run, starting at 1.
    pub seq: u64,
}

impl ChangeRecord {
    /// Status after the change, if the node still exists.
    pub fn curr_status(&self) -> Option<Status> {
        self.curr.as_ref().map(|c| c.status)
    }

    /// Status before the change, if the node existed.
    pub fn prev_status(&self) -> Option<Status> {
        self.prev.as_ref().map(|p| p.status)
    }
}

/// Ordered change records of one run.
///
/// Published schema: `{ run_id, snapshot_id, generated_at, changes, event_seq }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaFeed {
    /// Run that produced this feed.
    pub run_id: RunId,
    /// Content id of the snapshot this feed leads to.
    pub snapshot_id: SnapshotId,
    /// Generation timestamp.
    pub generated_at: DateTime<Utc>,
    /// Change records in priority order.
    pub changes: Vec<ChangeRecord>,
    /// Last event sequence number assigned in this run (0 when empty).
    pub event_seq: u64,
}

impl DeltaFeed {
    /// True when the run changed nothing.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Records that crossed a threshold.
    pub fn threshold_crossings(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.changes.iter().filter(|c| c.threshold_crossed)
    }

    /// Serialize for publication.
    pub fn to_published_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        published_bytes(self)
    }
}

/// Pointer record to the latest publication.
///
/// Lets a consumer detect "nothing changed" without downloading the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateIndex {
    /// Latest published run.
    pub latest_run_id: RunId,
    /// Content id of the latest published snapshot.
    pub latest_snapshot_id: SnapshotId,
    /// Event sequence number of the latest feed.
    pub latest_event_id: u64,
}

impl StateIndex {
    /// Build the state index that points at `feed`.
    pub fn for_feed(feed: &DeltaFeed) -> Self {
        Self {
            latest_run_id: feed.run_id.clone(),
            latest_snapshot_id: feed.snapshot_id.clone(),
            latest_event_id: feed.event_seq,
        }
    }

    /// Serialize for publication.
    pub fn to_published_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        published_bytes(self)
    }
}
