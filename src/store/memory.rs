//! In-memory content store for testing.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use xxhash_rust::xxh64::xxh64;

use super::{normalize_path, ContentStore, RevisionTag, StoreError, StoredObject};

/// Fault to inject into the next write to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// Fail with `TransientIo` without applying the write.
    Transient,
    /// Apply the write, then report `TransientIo` (a timeout after commit).
    TransientAfterApply,
}

/// In-memory content store.
///
/// Uses BTreeMap for deterministic iteration order. Every operation yields
/// to the runtime once, so concurrent tasks interleave the way they would
/// against a remote store.
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    /// Objects by normalized path.
    objects: RwLock<BTreeMap<String, StoredObject>>,
    /// Write counter; seeds revision tags so they never repeat.
    generation: AtomicU64,
    /// Pending injected faults per path.
    faults: Mutex<BTreeMap<String, VecDeque<StoreFault>>>,
    /// Paths of applied writes, in order.
    write_log: Mutex<Vec<String>>,
}

impl InMemoryContentStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object directly (test setup). Returns its revision.
    pub fn insert(&self, path: &str, content: impl Into<Vec<u8>>) -> RevisionTag {
        let path = normalize_path(path);
        let mut objects = self.objects.write();
        self.apply(&mut objects, &path, content.into())
    }

    /// Current bytes of an object.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .get(&normalize_path(path))
            .map(|o| o.content.clone())
    }

    /// Current revision of an object.
    pub fn revision(&self, path: &str) -> Option<RevisionTag> {
        self.objects
            .read()
            .get(&normalize_path(path))
            .map(|o| o.revision.clone())
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Stored paths under a directory prefix, sorted.
    pub fn paths_under(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", normalize_path(dir));
        self.objects
            .read()
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Paths of applied writes (via the trait), in order.
    pub fn write_log(&self) -> Vec<String> {
        self.write_log.lock().clone()
    }

    /// Queue a fault for the next write to `path`.
    pub fn inject_put_fault(&self, path: &str, fault: StoreFault) {
        self.faults
            .lock()
            .entry(normalize_path(path))
            .or_default()
            .push_back(fault);
    }

    fn next_fault(&self, path: &str) -> Option<StoreFault> {
        self.faults.lock().get_mut(path).and_then(VecDeque::pop_front)
    }

    fn apply(&self, objects: &mut BTreeMap<String, StoredObject>, path: &str, content: Vec<u8>) -> RevisionTag {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let revision = RevisionTag::new(format!("{:x}-{:016x}", generation, xxh64(&content, generation)));
        objects.insert(
            path.to_string(),
            StoredObject {
                content,
                revision: revision.clone(),
            },
        );
        revision
    }

    /// Apply a write through the trait: checks the precondition, honors
    /// injected faults and logs it, all under one write lock.
    fn write(
        &self,
        path: &str,
        content: Vec<u8>,
        precondition: Precondition<'_>,
    ) -> Result<RevisionTag, StoreError> {
        let mut objects = self.objects.write();
        let current = objects.get(path).map(|o| &o.revision);

        match precondition {
            Precondition::None => {}
            Precondition::Absent => {
                if current.is_some() {
                    return Err(StoreError::AlreadyExists { path: path.to_string() });
                }
            }
            Precondition::Revision(expected) => {
                if current != Some(expected) {
                    return Err(StoreError::RevisionConflict {
                        path: path.to_string(),
                        expected: expected.to_string(),
                        actual: current.map(|r| r.to_string()).unwrap_or_else(|| "<none>".into()),
                    });
                }
            }
        }

        match self.next_fault(path) {
            Some(StoreFault::Transient) => Err(StoreError::transient(path, "injected fault")),
            Some(StoreFault::TransientAfterApply) => {
                self.apply(&mut objects, path, content);
                self.write_log.lock().push(path.to_string());
                Err(StoreError::transient(path, "injected timeout after apply"))
            }
            None => {
                let revision = self.apply(&mut objects, path, content);
                self.write_log.lock().push(path.to_string());
                Ok(revision)
            }
        }
    }
}

enum Precondition<'a> {
    None,
    Absent,
    Revision(&'a RevisionTag),
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn get(&self, path: &str) -> Result<StoredObject, StoreError> {
        tokio::task::yield_now().await;
        let path = normalize_path(path);
        self.objects
            .read()
            .get(&path)
            .cloned()
            .ok_or(StoreError::NotFound { path })
    }

    async fn put(
        &self,
        path: &str,
        content: Vec<u8>,
        expected: Option<&RevisionTag>,
    ) -> Result<RevisionTag, StoreError> {
        tokio::task::yield_now().await;
        let path = normalize_path(path);
        let precondition = match expected {
            Some(tag) => Precondition::Revision(tag),
            None => Precondition::None,
        };
        self.write(&path, content, precondition)
    }

    async fn put_create(&self, path: &str, content: Vec<u8>) -> Result<RevisionTag, StoreError> {
        tokio::task::yield_now().await;
        let path = normalize_path(path);
        self.write(&path, content, Precondition::Absent)
    }
}
