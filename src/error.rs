//! Pipeline error taxonomy and structured error reports.
//!
//! | Kind | Fatal | Retried |
//! |------|-------|---------|
//! | `MalformedInput` | yes | no |
//! | `SchemaViolation` | yes | no |
//! | `ScoringDegraded` | no (warning) | no |
//! | `RevisionConflict` | after budget | yes, re-diff |
//! | `TransientIO` | after budget | yes, write only |
//! | `RetryBudgetExceeded` | yes | no |
//!
//! `NotFound` on the previous snapshot is not an error (bootstrap run).

use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::types::GraphError;

/// Error type for pipeline runs.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Input or stored snapshot failed to parse or validate.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// Store failure that was not retried.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Publishing kept failing with retryable errors.
    #[error("Retry budget exceeded after {attempts} publish attempts: {last}")]
    RetryBudgetExceeded {
        /// Publish attempts made.
        attempts: u32,
        /// The last retryable error.
        last: StoreError,
    },
    /// An artifact could not be serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl PipelineError {
    /// Taxonomy name of this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Graph(GraphError::MalformedInput(_)) => "MalformedInput",
            Self::Graph(GraphError::SchemaViolation(_)) => "SchemaViolation",
            Self::Store(StoreError::NotFound { .. }) => "NotFound",
            Self::Store(StoreError::RevisionConflict { .. })
            | Self::Store(StoreError::AlreadyExists { .. }) => "RevisionConflict",
            Self::Store(StoreError::TransientIo { .. }) => "TransientIO",
            Self::Store(StoreError::Backend(_)) => "StoreBackend",
            Self::Config(_) => "InvalidConfig",
            Self::RetryBudgetExceeded { .. } => "RetryBudgetExceeded",
            Self::Serialization(_) => "Serialization",
        }
    }

    /// Build a structured report for this error.
    pub fn report(&self, run_id: Option<&str>, state: &str) -> ErrorReport {
        let mut context = BTreeMap::new();
        match self {
            Self::RetryBudgetExceeded { attempts, last } => {
                context.insert("attempts".to_string(), attempts.to_string());
                context.insert("last_error".to_string(), last.to_string());
            }
            Self::Store(StoreError::NotFound { path })
            | Self::Store(StoreError::AlreadyExists { path }) => {
                context.insert("path".to_string(), path.clone());
            }
            Self::Store(StoreError::RevisionConflict { path, .. })
            | Self::Store(StoreError::TransientIo { path, .. }) => {
                context.insert("path".to_string(), path.clone());
            }
            Self::Graph(GraphError::SchemaViolation(violations)) => {
                context.insert("violations".to_string(), violations.len().to_string());
            }
            _ => {}
        }

        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            run_id: run_id.map(str::to_string),
            state: state.to_string(),
            context,
        }
    }
}

/// Structured, user-visible failure report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    /// Taxonomy name.
    pub kind: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Run id, if the run got far enough to have one.
    pub run_id: Option<String>,
    /// State the run failed in.
    pub state: String,
    /// Extra key/value context.
    pub context: BTreeMap<String, String>,
}
