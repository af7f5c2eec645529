//! Concurrency and failure tests for publication.
//!
//! Racing orchestrators are serialized by revision-conditioned writes only;
//! there is no in-process lock between them.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use threat_delta::store::memory::StoreFault;
use threat_delta::{
    ChangeReason, ContentStore, InMemoryContentStore, PipelineConfig, PipelineError,
    PublicationOrchestrator, RevisionTag, RunMode, RunState, Snapshot, StateIndex, StaticScorer,
    StoreError, StoredObject,
};

const INPUT: &str = "Data/network_topology.json";
const SNAPSHOT: &str = "Data/network_topology_scored.json";
const LATEST: &str = "Data/changes/latest.json";
const STATE: &str = "Data/state/index.json";
const HISTORY: &str = "Data/changes/history";

fn seeded_store() -> Arc<InMemoryContentStore> {
    let store = Arc::new(InMemoryContentStore::new());
    store.insert(INPUT, br#"{"nodes":[{"id":"n1"},{"id":"n2"}]}"#.to_vec());
    store
}

fn scorer(n1: f64, n2: f64) -> StaticScorer {
    StaticScorer::new().with_score("n1", n1).with_score("n2", n2)
}

fn orchestrator_with<S: ContentStore>(
    store: Arc<S>,
    scorer: StaticScorer,
    config: &PipelineConfig,
) -> PublicationOrchestrator<S> {
    PublicationOrchestrator::from_config(store.clone(), store, Arc::new(scorer), config, false).unwrap()
}

fn orchestrator(store: &Arc<InMemoryContentStore>, scorer: StaticScorer) -> PublicationOrchestrator<InMemoryContentStore> {
    orchestrator_with(store.clone(), scorer, &PipelineConfig::default())
}

async fn published_state<S: ContentStore>(store: &Arc<S>) -> StateIndex {
    orchestrator_with(store.clone(), StaticScorer::new(), &PipelineConfig::default())
        .output()
        .fetch_state()
        .await
        .unwrap()
        .expect("state index published")
}

// ─────────────────────────────────────────────────────────────────────────────
// Racing Publishers
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_racers_publish_once_each() {
    let store = seeded_store();
    let a = orchestrator(&store, scorer(0.1, 0.9));
    let b = orchestrator(&store, scorer(0.1, 0.9));

    let (ra, rb) = tokio::join!(a.run(RunMode::Commit), b.run(RunMode::Commit));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    // One run created the nodes; the other diffed against it and found nothing.
    let with_changes = [&ra, &rb].iter().filter(|r| !r.feed.changes.is_empty()).count();
    assert_eq!(with_changes, 1);

    let conflicts: u32 = [&ra, &rb].iter().map(|r| r.published.as_ref().unwrap().conflicts).sum();
    assert!(conflicts <= 1);

    let snapshot = Snapshot::parse(&store.contents(SNAPSHOT).unwrap()).unwrap();
    assert!(snapshot.nodes.iter().all(|n| n.version == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_racers_serialize_on_revision() {
    let store = seeded_store();
    let config = PipelineConfig { max_retries: 8, ..PipelineConfig::default() };

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let orch = orchestrator_with(store.clone(), scorer(0.1, 0.2 * i as f64 + 0.1), &config);
            tokio::spawn(async move { orch.run(RunMode::Commit).await })
        })
        .collect();

    let mut reports = Vec::new();
    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.state, RunState::Done);
        reports.push(report);
    }

    // Exactly one create-only snapshot write succeeded; every other run
    // either saw a published snapshot or re-diffed after a conflict.
    let creators = reports
        .iter()
        .filter(|r| r.bootstrap && r.published.as_ref().unwrap().conflicts == 0)
        .count();
    assert_eq!(creators, 1);
    let receipts: Vec<_> = reports.into_iter().filter_map(|r| r.published).collect();

    let state = published_state(&store).await;
    assert!(receipts.iter().any(|r| r.run_id == state.latest_run_id && !r.superseded));

    let snapshot = Snapshot::parse(&store.contents(SNAPSHOT).unwrap()).unwrap();
    assert_eq!(snapshot.content_id(), state.latest_snapshot_id);
    // n1 never changes, so it stays at its creation version.
    assert_eq!(snapshot.node(&"n1".into()).unwrap().version, 1);
}

#[tokio::test]
async fn test_loser_publishes_strictly_after_winner() {
    let store = seeded_store();
    let slow = orchestrator(&store, scorer(0.1, 0.9));
    let fast = orchestrator(&store, scorer(0.1, 0.6));

    // Slow run gets as far as Diffing against the empty store.
    let mut run = slow.start_run();
    let fetched = slow.fetch(&mut run).await.unwrap();
    assert!(fetched.previous.is_none());
    let scored = slow.score(&mut run, fetched.input);
    let outcome = slow.diff(&mut run, None, &scored.snapshot);
    assert_eq!(outcome.feed.changes.len(), 2);

    // Fast run publishes in between.
    let winner = fast.run(RunMode::Commit).await.unwrap();

    let published = slow
        .publish(&mut run, fetched.previous, &scored.snapshot, outcome)
        .await
        .unwrap();
    assert_eq!(run.state(), RunState::Publishing);
    assert_eq!(published.receipt.attempts, 2);
    assert_eq!(published.receipt.conflicts, 1);

    // The loser's feed is a diff against the winner's snapshot.
    let changes = &published.outcome.feed.changes;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].id.as_str(), "n2");
    assert_eq!(changes[0].reason, ChangeReason::StatusChange);
    assert_eq!(changes[0].prev, winner.feed.changes.iter().find(|c| c.id.as_str() == "n2").unwrap().curr);
    assert_eq!(changes[0].version, 2);

    let state = published_state(&store).await;
    assert_eq!(state.latest_run_id, published.receipt.run_id);
    assert_eq!(state.latest_run_id.as_str(), format!("{}-r1", run.run_id));

    // Winner history, loser's orphan and loser's published history.
    assert_eq!(store.paths_under(HISTORY).len(), 3);
    let latest = slow.output().fetch_latest_delta().await.unwrap().unwrap();
    assert_eq!(latest, published.outcome.feed);
    assert!(!published.receipt.superseded);
}

/// Holds the first write to the "latest delta" pointer until released.
struct GatedStore {
    inner: InMemoryContentStore,
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl GatedStore {
    async fn gate(&self, path: &str) {
        if path == LATEST && self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait]
impl ContentStore for GatedStore {
    async fn get(&self, path: &str) -> Result<StoredObject, StoreError> {
        self.inner.get(path).await
    }

    async fn put(&self, path: &str, content: Vec<u8>, expected: Option<&RevisionTag>) -> Result<RevisionTag, StoreError> {
        self.gate(path).await;
        self.inner.put(path, content, expected).await
    }

    async fn put_create(&self, path: &str, content: Vec<u8>) -> Result<RevisionTag, StoreError> {
        self.gate(path).await;
        self.inner.put_create(path, content).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_older_run_never_overwrites_newer_pointers() {
    let inner = InMemoryContentStore::new();
    inner.insert(INPUT, br#"{"nodes":[{"id":"n1"},{"id":"n2"}]}"#.to_vec());
    let store = Arc::new(GatedStore {
        inner,
        armed: AtomicBool::new(true),
        reached: Notify::new(),
        release: Notify::new(),
    });

    // The older run commits its snapshot, then stalls on the pointer.
    let older = orchestrator_with(store.clone(), scorer(0.1, 0.9), &PipelineConfig::default());
    let older = tokio::spawn(async move { older.run(RunMode::Commit).await });
    store.reached.notified().await;

    // A newer run diffs against it and publishes completely.
    let newer = orchestrator_with(store.clone(), scorer(0.1, 0.3), &PipelineConfig::default());
    let rb = newer.run(RunMode::Commit).await.unwrap();
    assert!(!rb.bootstrap);
    assert!(!rb.published.as_ref().unwrap().superseded);

    store.release.notify_one();
    let ra = older.await.unwrap().unwrap();
    let receipt = ra.published.unwrap();
    assert!(receipt.superseded);
    assert_eq!(receipt.conflicts, 0);

    // Pointer and state index still describe the newer run.
    let state = published_state(&store).await;
    assert_eq!(state.latest_run_id, rb.run_id);
    let snapshot = Snapshot::parse(&store.inner.contents(SNAPSHOT).unwrap()).unwrap();
    assert_eq!(state.latest_snapshot_id, snapshot.content_id());
    assert_eq!(state.latest_snapshot_id, rb.snapshot_id);
    assert_eq!(newer.output().fetch_latest_delta().await.unwrap(), Some(rb.feed));

    // The older feed remains readable in history.
    assert_eq!(store.inner.paths_under(HISTORY).len(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Transient Failures
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_transient_failures_retry_only_the_failed_write() {
    let store = seeded_store();
    let history_dir_writes = |store: &InMemoryContentStore| {
        store.write_log().iter().filter(|p| p.starts_with(HISTORY)).count()
    };

    store.inject_put_fault(LATEST, StoreFault::Transient);
    store.inject_put_fault(STATE, StoreFault::TransientAfterApply);

    let report = orchestrator(&store, scorer(0.1, 0.9)).run(RunMode::Commit).await.unwrap();
    let receipt = report.published.unwrap();

    assert_eq!(receipt.attempts, 3);
    assert_eq!(receipt.conflicts, 0);
    assert_eq!(history_dir_writes(&store), 1);
    assert_eq!(published_state(&store).await.latest_run_id, report.run_id);
}

#[tokio::test]
async fn test_history_write_retried_with_same_bytes() {
    let store = seeded_store();
    let orch = orchestrator(&store, scorer(0.1, 0.9));

    let mut run = orch.start_run();
    let history_path = format!("{}/{}.json", HISTORY, run.run_id);
    store.inject_put_fault(&history_path, StoreFault::TransientAfterApply);

    let fetched = orch.fetch(&mut run).await.unwrap();
    let scored = orch.score(&mut run, fetched.input);
    let outcome = orch.diff(&mut run, None, &scored.snapshot);
    let published = orch
        .publish(&mut run, fetched.previous, &scored.snapshot, outcome)
        .await
        .unwrap();

    // The repeated create found identical bytes and counted as success.
    assert_eq!(published.receipt.attempts, 2);
    assert_eq!(published.receipt.history_path, history_path);
    assert_eq!(store.paths_under(HISTORY), vec![history_path]);
}

/// Delegates to an in-memory store but stalls the first `stalls` writes to one path.
struct StallingStore {
    inner: InMemoryContentStore,
    path: &'static str,
    stalls: AtomicU32,
}

impl StallingStore {
    async fn maybe_stall(&self, path: &str) {
        if path == self.path && self.stalls.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[async_trait]
impl ContentStore for StallingStore {
    async fn get(&self, path: &str) -> Result<StoredObject, StoreError> {
        self.inner.get(path).await
    }

    async fn put(&self, path: &str, content: Vec<u8>, expected: Option<&RevisionTag>) -> Result<RevisionTag, StoreError> {
        self.maybe_stall(path).await;
        self.inner.put(path, content, expected).await
    }

    async fn put_create(&self, path: &str, content: Vec<u8>) -> Result<RevisionTag, StoreError> {
        self.maybe_stall(path).await;
        self.inner.put_create(path, content).await
    }
}

#[tokio::test]
async fn test_io_timeout_is_retried() {
    let inner = InMemoryContentStore::new();
    inner.insert(INPUT, br#"{"nodes":[{"id":"n1"}]}"#.to_vec());
    let store = Arc::new(StallingStore { inner, path: STATE, stalls: AtomicU32::new(2) });

    let config = PipelineConfig { io_timeout: Duration::from_millis(50), ..PipelineConfig::default() };
    let report = orchestrator_with(store.clone(), StaticScorer::new().with_score("n1", 0.5), &config)
        .run(RunMode::Commit)
        .await
        .unwrap();

    assert_eq!(report.published.unwrap().attempts, 3);
    assert!(store.inner.contents(STATE).is_some());
}

#[tokio::test]
async fn test_io_timeout_exhausts_budget() {
    let inner = InMemoryContentStore::new();
    inner.insert(INPUT, br#"{"nodes":[{"id":"n1"}]}"#.to_vec());
    let store = Arc::new(StallingStore { inner, path: LATEST, stalls: AtomicU32::new(10) });

    let config = PipelineConfig {
        io_timeout: Duration::from_millis(20),
        max_retries: 2,
        ..PipelineConfig::default()
    };
    let failure = orchestrator_with(store, StaticScorer::new().with_score("n1", 0.5), &config)
        .run(RunMode::Commit)
        .await
        .unwrap_err();

    assert_eq!(failure.state, RunState::Publishing);
    match &failure.error {
        PipelineError::RetryBudgetExceeded { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(last, StoreError::TransientIo { .. }));
        }
        other => panic!("expected RetryBudgetExceeded, got {:?}", other),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistent Conflicts
// ─────────────────────────────────────────────────────────────────────────────

/// Rejects every snapshot write as if another publisher always got there first.
struct ContendedStore {
    inner: InMemoryContentStore,
}

#[async_trait]
impl ContentStore for ContendedStore {
    async fn get(&self, path: &str) -> Result<StoredObject, StoreError> {
        self.inner.get(path).await
    }

    async fn put(&self, path: &str, content: Vec<u8>, expected: Option<&RevisionTag>) -> Result<RevisionTag, StoreError> {
        if path == SNAPSHOT {
            return Err(StoreError::RevisionConflict {
                path: path.to_string(),
                expected: expected.map(|r| r.to_string()).unwrap_or_default(),
                actual: "elsewhere".to_string(),
            });
        }
        self.inner.put(path, content, expected).await
    }

    async fn put_create(&self, path: &str, content: Vec<u8>) -> Result<RevisionTag, StoreError> {
        if path == SNAPSHOT {
            return Err(StoreError::AlreadyExists { path: path.to_string() });
        }
        self.inner.put_create(path, content).await
    }
}

#[tokio::test]
async fn test_conflict_budget_exceeded_leaves_only_history() {
    let inner = InMemoryContentStore::new();
    inner.insert(INPUT, br#"{"nodes":[{"id":"n1"}]}"#.to_vec());
    let store = Arc::new(ContendedStore { inner });

    let failure = orchestrator_with(store.clone(), StaticScorer::new().with_score("n1", 0.5), &PipelineConfig::default())
        .run(RunMode::Commit)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, PipelineError::RetryBudgetExceeded { attempts: 4, .. }));
    assert_eq!(failure.report().kind, "RetryBudgetExceeded");
    assert_eq!(failure.report().context.get("attempts").map(String::as_str), Some("4"));

    // One orphaned history object per attempt; nothing else was written.
    let written = store.inner.write_log();
    assert_eq!(written.len(), 4);
    assert!(written.iter().all(|p| p.starts_with(HISTORY)));
    assert!(store.inner.contents(LATEST).is_none());
    assert!(store.inner.contents(STATE).is_none());
}
