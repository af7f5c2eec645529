//! Remote content store backends.
//!
//! A content store is a whole-object key/value store with opaque revision
//! tags. Writes are whole-object replacements, optionally conditioned on the
//! revision the caller last read (optimistic concurrency). Backends never
//! retry internally: retry policy belongs to the orchestrator.

pub mod memory;
pub mod fs;

#[cfg(feature = "github")]
pub mod github;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Opaque token identifying an object's current revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionTag(String);

impl RevisionTag {
    /// Wrap a backend revision token.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Borrow as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An object read from the store with its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object bytes.
    pub content: Vec<u8>,
    /// Revision of these bytes.
    pub revision: RevisionTag,
}

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No object at this path.
    #[error("Object not found: {path}")]
    NotFound {
        /// Requested path.
        path: String,
    },
    /// The object's current revision does not match the expected one.
    #[error("Revision conflict on {path}: expected {expected}, found {actual}")]
    RevisionConflict {
        /// Path written.
        path: String,
        /// Revision the caller expected.
        expected: String,
        /// Revision actually present ("<none>" if the object is gone).
        actual: String,
    },
    /// A create-only write found an existing object.
    #[error("Object already exists: {path}")]
    AlreadyExists {
        /// Path written.
        path: String,
    },
    /// Timeout or transport failure; the call may succeed if repeated.
    #[error("Transient I/O failure on {path}: {reason}")]
    TransientIo {
        /// Path accessed.
        path: String,
        /// Failure description.
        reason: String,
    },
    /// Non-retryable backend failure (auth, bad request, local I/O).
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True for errors the orchestrator may retry within its budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RevisionConflict { .. } | Self::AlreadyExists { .. } | Self::TransientIo { .. }
        )
    }

    /// True if this is a conflict on a conditioned or create-only write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::RevisionConflict { .. } | Self::AlreadyExists { .. })
    }

    pub(crate) fn transient(path: &str, reason: impl fmt::Display) -> Self {
        Self::TransientIo {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Trait for content store backends.
///
/// All methods are async to support remote backends.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Read an object and its revision.
    async fn get(&self, path: &str) -> Result<StoredObject, StoreError>;

    /// Replace an object.
    ///
    /// With `expected = Some(tag)` the write succeeds only if the object's
    /// current revision is `tag`, otherwise it fails with `RevisionConflict`.
    /// With `expected = None` the write is unconditional (create or replace).
    async fn put(
        &self,
        path: &str,
        content: Vec<u8>,
        expected: Option<&RevisionTag>,
    ) -> Result<RevisionTag, StoreError>;

    /// Create an object that must not exist yet (`AlreadyExists` otherwise).
    async fn put_create(&self, path: &str, content: Vec<u8>) -> Result<RevisionTag, StoreError>;
}

/// Normalize a store path: forward slashes, no leading slash, no empty or
/// `.` segments.
pub fn normalize_path(path: &str) -> String {
    static SEPARATORS: OnceLock<regex_lite::Regex> = OnceLock::new();
    let separators = SEPARATORS.get_or_init(|| {
        regex_lite::Regex::new(r"[/\\]+").expect("valid separator regex")
    });

    separators
        .split(path.trim())
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join path segments into one normalized store path.
pub fn join_path(prefix: &str, path: &str) -> String {
    normalize_path(&format!("{}/{}", prefix, path))
}

pub use memory::InMemoryContentStore;
pub use fs::FsContentStore;

#[cfg(feature = "github")]
pub use github::{GitHubContentStore, GitHubRepo};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/Data//changes/./latest.json"), "Data/changes/latest.json");
        assert_eq!(normalize_path("Data\\state\\index.json"), "Data/state/index.json");
        assert_eq!(join_path("safe/", "/Data/a.json"), "safe/Data/a.json");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::transient("p", "timeout").is_retryable());
        assert!(StoreError::AlreadyExists { path: "p".into() }.is_conflict());
        assert!(!StoreError::NotFound { path: "p".into() }.is_retryable());
        assert!(!StoreError::Backend("denied".into()).is_retryable());
    }
}
