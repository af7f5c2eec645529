//! Priority ranking of change records.
//!
//! The delta feed is ordered so the visualization layer can focus the most
//! urgent nodes first. Ranks, highest priority first:
//!
//! ```text
//! MaliciousCrossing > StatusCrossing > ScoreJump > Created > Removed
//! ```
//!
//! Ties are broken by node id ascending.

use std::cmp::Ordering;

use crate::types::{ChangeReason, ChangeRecord, Status};

/// Priority class of a change record.
///
/// Declaration order is feed order: smaller sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangePriority {
    /// Status change that lands on malicious.
    MaliciousCrossing,
    /// Any other status change.
    StatusCrossing,
    /// Same status, large score movement.
    ScoreJump,
    /// Newly created node.
    Created,
    /// Removed node.
    Removed,
}

impl ChangePriority {
    /// Classify a change record.
    pub fn of(record: &ChangeRecord) -> Self {
        match record.reason {
            ChangeReason::StatusChange if record.curr_status() == Some(Status::Malicious) => {
                Self::MaliciousCrossing
            }
            ChangeReason::StatusChange => Self::StatusCrossing,
            ChangeReason::ScoreJump => Self::ScoreJump,
            ChangeReason::Created => Self::Created,
            ChangeReason::Removed => Self::Removed,
        }
    }
}

/// Feed ordering: priority class, then node id ascending.
pub fn feed_order(a: &ChangeRecord, b: &ChangeRecord) -> Ordering {
    ChangePriority::of(a)
        .cmp(&ChangePriority::of(b))
        .then_with(|| a.id.cmp(&b.id))
}
