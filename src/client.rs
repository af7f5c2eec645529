//! Snapshot store client.
//!
//! Typed reads and writes of the pipeline's objects on top of a
//! [`ContentStore`]. Every call is bounded by an I/O timeout; a timed-out
//! call fails with `TransientIo`. The client never retries: only the
//! orchestrator knows whether a retry needs a fresh diff.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;
use crate::store::{join_path, normalize_path, ContentStore, RevisionTag, StoreError, StoredObject};
use crate::types::{DeltaFeed, InputGraph, RunId, Snapshot, StateIndex};

/// Paths of every object the pipeline reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePaths {
    /// Raw input graph.
    pub input: String,
    /// Published snapshot.
    pub snapshot: String,
    /// "Latest delta" pointer object.
    pub latest_delta: String,
    /// Directory of immutable per-run delta feeds.
    pub history_dir: String,
    /// State index.
    pub state_index: String,
}

impl StorePaths {
    /// Path of the immutable delta feed of `run_id`.
    pub fn history_path(&self, run_id: &RunId) -> String {
        join_path(&self.history_dir, &format!("{}.json", run_id))
    }

    /// Same paths with every output moved under `prefix`. Input is unchanged.
    pub fn isolated(&self, prefix: &str) -> Self {
        Self {
            input: self.input.clone(),
            snapshot: join_path(prefix, &self.snapshot),
            latest_delta: join_path(prefix, &self.latest_delta),
            history_dir: join_path(prefix, &self.history_dir),
            state_index: join_path(prefix, &self.state_index),
        }
    }
}

impl Default for StorePaths {
    fn default() -> Self {
        Self {
            input: "Data/network_topology.json".to_string(),
            snapshot: "Data/network_topology_scored.json".to_string(),
            latest_delta: "Data/changes/latest.json".to_string(),
            history_dir: "Data/changes/history".to_string(),
            state_index: "Data/state/index.json".to_string(),
        }
    }
}

/// A previously published snapshot with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedSnapshot {
    /// Parsed snapshot.
    pub snapshot: Snapshot,
    /// Revision tag to condition the next write on.
    pub revision: RevisionTag,
    /// Raw bytes as stored.
    pub content: Vec<u8>,
}

/// Typed client over a content store.
pub struct SnapshotStoreClient<S: ContentStore> {
    store: Arc<S>,
    paths: StorePaths,
    io_timeout: Duration,
}

impl<S: ContentStore> SnapshotStoreClient<S> {
    /// Create a new client.
    pub fn new(store: Arc<S>, paths: StorePaths, io_timeout: Duration) -> Self {
        Self { store, paths, io_timeout }
    }

    /// Paths used by this client.
    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn bounded<T, F>(&self, path: &str, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.io_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::transient(
                &normalize_path(path),
                format!("timed out after {:?}", self.io_timeout),
            )),
        }
    }

    /// Read an object.
    pub async fn get(&self, path: &str) -> Result<StoredObject, StoreError> {
        tracing::debug!(path = %path, "Store get");
        self.bounded(path, self.store.get(path)).await
    }

    /// Replace an object, optionally conditioned on `expected`.
    pub async fn put(
        &self,
        path: &str,
        content: Vec<u8>,
        expected: Option<&RevisionTag>,
    ) -> Result<RevisionTag, StoreError> {
        tracing::debug!(path = %path, conditioned = expected.is_some(), "Store put");
        self.bounded(path, self.store.put(path, content, expected)).await
    }

    /// Create an object that must not exist yet.
    pub async fn put_create(&self, path: &str, content: Vec<u8>) -> Result<RevisionTag, StoreError> {
        tracing::debug!(path = %path, "Store put_create");
        self.bounded(path, self.store.put_create(path, content)).await
    }

    /// Read, parse and validate the raw input graph.
    pub async fn fetch_input(&self) -> Result<InputGraph, PipelineError> {
        let object = self.get(&self.paths.input).await?;
        let graph = InputGraph::parse(&object.content)?;
        graph.validate()?;
        Ok(graph)
    }

    /// Read the previously published snapshot. `None` on a bootstrap run.
    pub async fn fetch_snapshot(&self) -> Result<Option<PublishedSnapshot>, PipelineError> {
        let object = match self.get(&self.paths.snapshot).await {
            Ok(object) => object,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = Snapshot::parse(&object.content)?;
        snapshot.validate()?;
        Ok(Some(PublishedSnapshot {
            snapshot,
            revision: object.revision,
            content: object.content,
        }))
    }

    /// Read the state index, if one was published.
    pub async fn fetch_state(&self) -> Result<Option<StateIndex>, PipelineError> {
        self.fetch_json(&self.paths.state_index).await
    }

    /// Read the latest delta feed, if one was published.
    pub async fn fetch_latest_delta(&self) -> Result<Option<DeltaFeed>, PipelineError> {
        self.fetch_json(&self.paths.latest_delta).await
    }

    async fn fetch_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>, PipelineError> {
        match self.get(path).await {
            Ok(object) => Ok(Some(serde_json::from_slice(&object.content).map_err(
                |e| crate::types::GraphError::MalformedInput(format!("{}: {}", path, e)),
            )?)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the immutable history object of a feed.
    ///
    /// Re-writing identical bytes (a repeat after a timed-out write) succeeds;
    /// different bytes at the same run id fail with `AlreadyExists`.
    pub async fn write_history(&self, run_id: &RunId, content: Vec<u8>) -> Result<RevisionTag, StoreError> {
        let path = self.paths.history_path(run_id);
        match self.put_create(&path, content.clone()).await {
            Err(StoreError::AlreadyExists { path }) => {
                let existing = self.get(&path).await?;
                if existing.content == content {
                    Ok(existing.revision)
                } else {
                    Err(StoreError::AlreadyExists { path })
                }
            }
            other => other,
        }
    }

    /// Write the snapshot, conditioned on the revision it replaces.
    ///
    /// `None` means no snapshot existed (bootstrap): create-only.
    pub async fn write_snapshot(
        &self,
        content: Vec<u8>,
        expected: Option<&RevisionTag>,
    ) -> Result<RevisionTag, StoreError> {
        self.write_conditioned(&self.paths.snapshot, content, expected).await
    }

    /// Replace the "latest delta" pointer read at `expected` (`None`: absent).
    pub async fn write_latest_delta(
        &self,
        content: Vec<u8>,
        expected: Option<&RevisionTag>,
    ) -> Result<RevisionTag, StoreError> {
        self.write_conditioned(&self.paths.latest_delta, content, expected).await
    }

    /// Replace the state index read at `expected` (`None`: absent).
    pub async fn write_state(
        &self,
        content: Vec<u8>,
        expected: Option<&RevisionTag>,
    ) -> Result<RevisionTag, StoreError> {
        self.write_conditioned(&self.paths.state_index, content, expected).await
    }

    async fn write_conditioned(
        &self,
        path: &str,
        content: Vec<u8>,
        expected: Option<&RevisionTag>,
    ) -> Result<RevisionTag, StoreError> {
        match expected {
            Some(tag) => self.put(path, content, Some(tag)).await,
            None => self.put_create(path, content).await,
        }
    }

    /// Current revision of an object, `None` if it does not exist.
    pub async fn revision_of(&self, path: &str) -> Result<Option<RevisionTag>, StoreError> {
        match self.get(path).await {
            Ok(object) => Ok(Some(object.revision)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
