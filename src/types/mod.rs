//! Core types for the scored topology graph.

pub mod node;
pub mod edge;
pub mod snapshot;
pub mod delta;

pub use node::{NodeId, Status, InputNode, ScoredNode, ScoredFields};
pub use edge::Edge;
pub use snapshot::{InputGraph, Snapshot, SnapshotId, GraphError, SchemaViolation};
pub use delta::{RunId, RunStamp, EntityKind, ChangeReason, ChangeRecord, DeltaFeed, StateIndex};
