//! Local filesystem content store.
//!
//! Objects are files under a root directory; the revision tag of an object
//! is the SHA-256 of its bytes. Writes hold an exclusive `flock` on
//! `<root>/.threat-delta.lock` across the revision check and the write, so
//! stores in other processes sharing the root are serialized too. Replacing
//! writes land via write-to-temp + rename; creating writes hard-link the
//! temp file into place, which fails if the target already exists. Readers
//! never see a partial object.

use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{normalize_path, ContentStore, RevisionTag, StoreError, StoredObject};
use crate::canonical::sha256_hex;

/// Name of the lock file at the store root.
pub const LOCK_FILE: &str = ".threat-delta.lock";

/// Filesystem-backed content store.
#[derive(Debug)]
pub struct FsContentStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

/// Held `flock` on the root lock file; dropping the file releases it.
struct RootLock {
    _file: File,
}

impl FsContentStore {
    /// Create a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let normalized = normalize_path(path);
        if normalized.is_empty()
            || normalized == LOCK_FILE
            || normalized.split('/').any(|segment| segment == "..")
        {
            return Err(StoreError::Backend(format!("invalid store path: {:?}", path)));
        }
        Ok(self.root.join(normalized))
    }

    /// Take the cross-process write lock. Blocks a worker thread, not the runtime.
    async fn lock_root(&self, path: &str) -> Result<RootLock, StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(path, e))?;

        let lock_path = self.root.join(LOCK_FILE);
        let file = tokio::task::spawn_blocking(move || -> io::Result<File> {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            flock_exclusive(&file)?;
            Ok(file)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("{}: lock task failed: {}", path, e)))?
        .map_err(|e| io_error(path, e))?;

        Ok(RootLock { _file: file })
    }

    async fn read_revision(&self, file: &Path, path: &str) -> Result<Option<RevisionTag>, StoreError> {
        match tokio::fs::read(file).await {
            Ok(bytes) => Ok(Some(RevisionTag::new(sha256_hex(&bytes)))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path, e)),
        }
    }

    /// Write `content` to a fresh temp file next to `file`.
    async fn stage(&self, file: &Path, path: &str, content: &[u8]) -> Result<PathBuf, StoreError> {
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }

        let tmp = file.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp, content).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(path, e));
        }
        Ok(tmp)
    }

    async fn replace(&self, file: &Path, path: &str, content: &[u8]) -> Result<RevisionTag, StoreError> {
        let tmp = self.stage(file, path, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, file).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(path, e));
        }

        tracing::debug!(path = %path, bytes = content.len(), "Wrote object");
        Ok(RevisionTag::new(sha256_hex(content)))
    }

    async fn create(&self, file: &Path, path: &str, content: &[u8]) -> Result<RevisionTag, StoreError> {
        let tmp = self.stage(file, path, content).await?;
        let linked = tokio::fs::hard_link(&tmp, file).await;
        let _ = tokio::fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => {
                tracing::debug!(path = %path, bytes = content.len(), "Created object");
                Ok(RevisionTag::new(sha256_hex(content)))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StoreError::AlreadyExists {
                path: normalize_path(path),
            }),
            Err(e) => Err(io_error(path, e)),
        }
    }
}

fn flock_exclusive(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: flock is a standard POSIX call. fd is a valid file
            // descriptor owned by `file`. LOCK_EX blocks until acquired.
            #[allow(unsafe_code)]
            let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

fn io_error(path: &str, e: std::io::Error) -> StoreError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
            StoreError::transient(path, e)
        }
        _ => StoreError::Backend(format!("{}: {}", path, e)),
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn get(&self, path: &str) -> Result<StoredObject, StoreError> {
        let file = self.resolve(path)?;
        match tokio::fs::read(&file).await {
            Ok(content) => {
                let revision = RevisionTag::new(sha256_hex(&content));
                Ok(StoredObject { content, revision })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                path: normalize_path(path),
            }),
            Err(e) => Err(io_error(path, e)),
        }
    }

    async fn put(
        &self,
        path: &str,
        content: Vec<u8>,
        expected: Option<&RevisionTag>,
    ) -> Result<RevisionTag, StoreError> {
        let file = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;
        let _root = self.lock_root(path).await?;

        if let Some(expected) = expected {
            let actual = self.read_revision(&file, path).await?;
            if actual.as_ref() != Some(expected) {
                return Err(StoreError::RevisionConflict {
                    path: normalize_path(path),
                    expected: expected.to_string(),
                    actual: actual.map(|r| r.to_string()).unwrap_or_else(|| "<none>".into()),
                });
            }
        }

        self.replace(&file, path, &content).await
    }

    async fn put_create(&self, path: &str, content: Vec<u8>) -> Result<RevisionTag, StoreError> {
        let file = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;
        let _root = self.lock_root(path).await?;

        self.create(&file, path, &content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_round_trip_and_revision() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());

        let r1 = store.put_create("Data/a.json", b"hello".to_vec()).await.unwrap();
        let obj = store.get("Data/a.json").await.unwrap();
        assert_eq!(obj.content, b"hello");
        assert_eq!(obj.revision, r1);
        assert!(dir.path().join("Data/a.json").exists());
    }

    #[tokio::test]
    async fn test_conflict_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());

        let r1 = store.put("a.json", b"one".to_vec(), None).await.unwrap();
        let r2 = store.put("a.json", b"two".to_vec(), Some(&r1)).await.unwrap();

        let err = store.put("a.json", b"three".to_vec(), Some(&r1)).await.unwrap_err();
        assert!(matches!(err, StoreError::RevisionConflict { .. }));

        let err = store.put_create("a.json", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        assert_eq!(store.get("a.json").await.unwrap().revision, r2);
    }

    #[tokio::test]
    async fn test_not_found_and_escape() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());

        assert!(matches!(store.get("missing.json").await, Err(StoreError::NotFound { .. })));
        assert!(matches!(store.get("../etc/passwd").await, Err(StoreError::Backend(_))));
        assert!(matches!(store.put(LOCK_FILE, b"x".to_vec(), None).await, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_create_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());

        store.put_create("d/a.json", b"one".to_vec()).await.unwrap();
        assert!(store.put_create("d/a.json", b"two".to_vec()).await.is_err());

        let names: Vec<String> = std::fs::read_dir(dir.path().join("d"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json".to_string()]);
        assert_eq!(store.get("d/a.json").await.unwrap().content, b"one");
    }

    /// Two stores over one directory stand in for two processes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stores_sharing_a_root_serialize_writes() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(FsContentStore::new(dir.path()));
        let b = Arc::new(FsContentStore::new(dir.path()));

        for i in 0..50 {
            let path = format!("race/{}.json", i);

            let create = |store: Arc<FsContentStore>, body: &'static [u8]| {
                let path = path.clone();
                tokio::spawn(async move { store.put_create(&path, body.to_vec()).await })
            };
            let (ra, rb) = tokio::join!(create(a.clone(), b"a"), create(b.clone(), b"b"));
            let results = [ra.unwrap(), rb.unwrap()];
            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "create {}", i);
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(StoreError::AlreadyExists { .. }))));
            let base = a.get(&path).await.unwrap().revision;

            let replace = |store: Arc<FsContentStore>, body: &'static [u8]| {
                let path = path.clone();
                let base = base.clone();
                tokio::spawn(async move { store.put(&path, body.to_vec(), Some(&base)).await })
            };
            let (ra, rb) = tokio::join!(replace(a.clone(), b"a2"), replace(b.clone(), b"b2"));
            let results = [ra.unwrap(), rb.unwrap()];
            let winners: Vec<&RevisionTag> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            assert_eq!(winners.len(), 1, "replace {}", i);
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(StoreError::RevisionConflict { .. }))));
            assert_eq!(&b.get(&path).await.unwrap().revision, winners[0]);
        }
    }
}
