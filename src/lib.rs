//! # threat-delta
//!
//! Graph risk scoring with delta tracking and safe publication.
//!
//! Each run reads a raw network topology graph, scores every node with a
//! threat model, diffs the result against the previously published snapshot
//! and publishes the new snapshot together with an ordered change feed.
//!
//! ## Architecture
//!
//! ```text
//! source store ──→ InputGraph ──→ ScorerAdapter ──→ Snapshot (current)
//!                                                        ↓
//! output store ──→ Snapshot (previous) ──────→ DeltaComputator
//!      ↑                                                 ↓
//!      └──── PublicationOrchestrator ←── DeltaFeed + Snapshot (versioned)
//! ```
//!
//! ## Guarantees
//!
//! - Same scored content → identical snapshot content id, regardless of
//!   attribute order, float noise below 1e-6 or timestamps
//! - A node's version increases iff its scored fields changed; versions are
//!   never taken from input
//! - Change feeds are ordered by priority, then node id
//! - Concurrent publishers are serialized by revision-conditioned writes;
//!   the loser re-diffs against the winner's snapshot

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod policy;
pub mod canonical;
pub mod config;
pub mod error;
pub mod store;
pub mod client;
pub mod scorer;
pub mod delta;
pub mod orchestrator;

/// Schema version mixed into snapshot content ids.
///
/// Bump when the canonical form changes so old and new ids never collide.
pub const SNAPSHOT_SCHEMA_VERSION: &str = "threat-snapshot-v1";

// Re-exports
pub use types::{
    ChangeReason, ChangeRecord, DeltaFeed, Edge, EntityKind, GraphError, InputGraph, InputNode,
    NodeId, RunId, RunStamp, SchemaViolation, ScoredFields, ScoredNode, Snapshot, SnapshotId,
    StateIndex, Status,
};
pub use policy::{classify, feed_order, ChangePriority, DeltaPolicy, Thresholds};
pub use canonical::{quantize, sha256_hex, to_canonical_bytes};
pub use config::{ConfigError, PipelineConfig};
pub use error::{ErrorReport, PipelineError};
pub use store::{
    ContentStore, FsContentStore, InMemoryContentStore, RevisionTag, StoreError, StoredObject,
};
#[cfg(feature = "github")]
pub use store::{GitHubContentStore, GitHubRepo};
pub use client::{PublishedSnapshot, SnapshotStoreClient, StorePaths};
pub use scorer::{
    DegradeReason, FnScorer, IdentifierTailScorer, ScoreError, ScoredGraph, Scorer, ScorerAdapter,
    ScoringReport, ScoringWarning, StaticScorer,
};
pub use delta::{DeltaComputator, DiffOutcome};
pub use orchestrator::{
    Fetched, PipelineRun, PublicationOrchestrator, PublishReceipt, Published, RunFailure,
    RunMode, RunReport, RunState,
};
