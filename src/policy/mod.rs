//! Threshold and priority policy definitions.

pub mod thresholds;
pub mod priority;

pub use thresholds::{classify, Thresholds, DeltaPolicy};
pub use priority::{feed_order, ChangePriority};
