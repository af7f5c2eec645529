//! Publication orchestrator.
//!
//! Drives one pipeline run through its state machine:
//!
//! ```text
//! Fetching → Scoring → Diffing → Publishing → Done
//!     ↓         ↓         ↓          ↓
//!   Failed    Failed    Failed     Failed
//! ```
//!
//! A dry run stops after Diffing and reports the would-be feed.
//!
//! ## Publishing
//!
//! Objects are written in this order:
//!
//! 1. per-run delta history (create-only, keyed by run id)
//! 2. snapshot, conditioned on the revision read during Fetching
//! 3. "latest delta" pointer
//! 4. state index
//!
//! The conditioned snapshot write is the commit point: a run that fails
//! before it leaves at most an orphaned history object behind. On a revision
//! conflict the snapshot is re-fetched and re-diffed (scoring output is
//! reused) under the run id suffixed `-r<n>`, so the new history object does
//! not collide with the orphaned one. A transient I/O failure repeats only
//! the failed write with the same bytes. Conflicts and transient failures
//! share one retry budget.
//!
//! The pointer and the state index are compare-and-swapped too. Before
//! writing them the run reads their revisions, then checks that the stored
//! snapshot is still the one it committed. If a newer run has committed in
//! the meantime, this run is superseded: its feed stays in history and the
//! pointers are left to the newer run. A pointer conflict repeats the check.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;

use crate::client::{PublishedSnapshot, SnapshotStoreClient};
use crate::config::{ConfigError, PipelineConfig};
use crate::delta::{DeltaComputator, DiffOutcome};
use crate::error::{ErrorReport, PipelineError};
use crate::scorer::{ScoredGraph, Scorer, ScorerAdapter, ScoringWarning};
use crate::store::{ContentStore, RevisionTag, StoreError};
use crate::types::{DeltaFeed, InputGraph, RunId, RunStamp, Snapshot, SnapshotId, StateIndex, Status};

/// State of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunState {
    /// Reading the input graph and the previous snapshot.
    Fetching,
    /// Scoring the input graph.
    Scoring,
    /// Diffing against the previous snapshot.
    Diffing,
    /// Writing artifacts.
    Publishing,
    /// Finished successfully.
    Done,
    /// Terminated by an error.
    Failed,
}

impl RunState {
    /// True for `Done` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fetching => "Fetching",
            Self::Scoring => "Scoring",
            Self::Diffing => "Diffing",
            Self::Publishing => "Publishing",
            Self::Done => "Done",
            Self::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Whether a run publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Fetch, score and diff; report only.
    DryRun,
    /// Full run including Publishing.
    Commit,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DryRun => write!(f, "dry_run"),
            Self::Commit => write!(f, "commit"),
        }
    }
}

/// One pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRun {
    /// Run identifier.
    pub run_id: RunId,
    /// Wall-clock start; also the generation time of the first diff.
    pub started_at: DateTime<Utc>,
    state: RunState,
    transitions: Vec<RunState>,
}

impl PipelineRun {
    /// Create a run in the `Fetching` state.
    pub fn new(run_id: RunId, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            state: RunState::Fetching,
            transitions: vec![RunState::Fetching],
        }
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Every state entered, in order.
    pub fn transitions(&self) -> &[RunState] {
        &self.transitions
    }

    fn advance(&mut self, next: RunState) {
        if self.state == next {
            return;
        }
        tracing::info!(run_id = %self.run_id, from = %self.state, to = %next, "Run state transition");
        self.state = next;
        self.transitions.push(next);
    }

    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.advance(RunState::Failed);
        }
    }
}

/// Output of the Fetching state.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    /// Validated raw input graph.
    pub input: InputGraph,
    /// Previously published snapshot, `None` on a bootstrap run.
    pub previous: Option<PublishedSnapshot>,
}

/// What a successful publication wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    /// Run id the artifacts were published under.
    pub run_id: RunId,
    /// Path of the history object.
    pub history_path: String,
    /// Revision of the committed snapshot.
    pub snapshot_revision: RevisionTag,
    /// Publish attempts made.
    pub attempts: u32,
    /// Revision conflicts resolved by re-diffing.
    pub conflicts: u32,
    /// A newer run committed before the pointers were written; they were
    /// left to it.
    pub superseded: bool,
}

/// Output of the Publishing state.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    /// The diff that was actually published (re-diffed after conflicts).
    pub outcome: DiffOutcome,
    /// Publication details.
    pub receipt: PublishReceipt,
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: RunId,
    /// Dry run or commit.
    pub mode: RunMode,
    /// Terminal state (`Done`).
    pub state: RunState,
    /// States entered, in order.
    pub transitions: Vec<RunState>,
    /// True if no previous snapshot existed.
    pub bootstrap: bool,
    /// The published (or would-be) delta feed.
    pub feed: DeltaFeed,
    /// Content id of the published (or would-be) snapshot.
    pub snapshot_id: SnapshotId,
    /// Nodes in that snapshot.
    pub nodes: usize,
    /// Of which suspicious.
    pub suspicious: usize,
    /// Of which malicious.
    pub malicious: usize,
    /// Scoring degradations.
    pub warnings: Vec<ScoringWarning>,
    /// Publication details, absent on a dry run.
    pub published: Option<PublishReceipt>,
}

/// A run that ended in `Failed`.
#[derive(Debug, thiserror::Error)]
#[error("Run {run_id} failed in {state}: {error}")]
pub struct RunFailure {
    /// Run identifier.
    pub run_id: RunId,
    /// State the run was in when it failed.
    pub state: RunState,
    /// Cause.
    #[source]
    pub error: PipelineError,
}

impl RunFailure {
    /// Structured report for the caller.
    pub fn report(&self) -> ErrorReport {
        self.error.report(Some(self.run_id.as_str()), &self.state.to_string())
    }
}

#[derive(Debug, Default)]
struct PublishProgress {
    history: bool,
    snapshot: Option<RevisionTag>,
    latest: bool,
    state: bool,
    superseded: bool,
}

/// Serialized artifacts of one diff plus how far their publication got.
struct PublishAttempt {
    previous: Option<PublishedSnapshot>,
    outcome: DiffOutcome,
    feed_bytes: Vec<u8>,
    snapshot_bytes: Vec<u8>,
    state_bytes: Vec<u8>,
    progress: PublishProgress,
    /// Set after a conflict: re-fetch before writing again.
    stale: bool,
}

impl PublishAttempt {
    fn new(previous: Option<PublishedSnapshot>, outcome: DiffOutcome) -> Result<Self, PipelineError> {
        Ok(Self {
            feed_bytes: outcome.feed.to_published_bytes()?,
            snapshot_bytes: outcome.snapshot.to_published_bytes()?,
            state_bytes: StateIndex::for_feed(&outcome.feed).to_published_bytes()?,
            previous,
            outcome,
            progress: PublishProgress::default(),
            stale: false,
        })
    }
}

/// Drives pipeline runs against an output store `S`, reading input from `I`.
pub struct PublicationOrchestrator<S: ContentStore, I: ContentStore = S> {
    source: SnapshotStoreClient<I>,
    output: SnapshotStoreClient<S>,
    scorer: ScorerAdapter,
    computator: DeltaComputator,
    max_retries: u32,
}

impl<S: ContentStore, I: ContentStore> PublicationOrchestrator<S, I> {
    /// Create an orchestrator from its parts.
    pub fn new(
        source: SnapshotStoreClient<I>,
        output: SnapshotStoreClient<S>,
        scorer: ScorerAdapter,
        computator: DeltaComputator,
        max_retries: u32,
    ) -> Self {
        Self { source, output, scorer, computator, max_retries }
    }

    /// Create an orchestrator from configuration.
    ///
    /// In safe mode every output path, including the previous snapshot
    /// read, moves under the configured safe prefix.
    pub fn from_config(
        source: Arc<I>,
        output: Arc<S>,
        scorer: Arc<dyn Scorer>,
        config: &PipelineConfig,
        safe: bool,
    ) -> Result<Self, ConfigError> {
        let adapter = ScorerAdapter::new(scorer, config.thresholds, config.default_score)?;
        Ok(Self::new(
            SnapshotStoreClient::new(source, config.paths.clone(), config.io_timeout),
            SnapshotStoreClient::new(output, config.effective_paths(safe), config.io_timeout),
            adapter,
            DeltaComputator::new(config.delta),
            config.max_retries,
        ))
    }

    /// Output store client.
    pub fn output(&self) -> &SnapshotStoreClient<S> {
        &self.output
    }

    /// Begin a new run.
    pub fn start_run(&self) -> PipelineRun {
        let started_at = Utc::now();
        PipelineRun::new(RunId::generate(started_at), started_at)
    }

    /// Execute a full run.
    pub async fn run(&self, mode: RunMode) -> Result<RunReport, RunFailure> {
        let mut run = self.start_run();
        let span = tracing::info_span!("pipeline_run", run_id = %run.run_id, mode = %mode);

        match self.execute(&mut run, mode).instrument(span).await {
            Ok(report) => Ok(report),
            Err(error) => {
                let failed_in = run.state();
                run.fail();
                tracing::error!(
                    run_id = %run.run_id,
                    state = %failed_in,
                    kind = error.kind(),
                    error = %error,
                    "Pipeline run failed"
                );
                Err(RunFailure {
                    run_id: run.run_id,
                    state: failed_in,
                    error,
                })
            }
        }
    }

    async fn execute(&self, run: &mut PipelineRun, mode: RunMode) -> Result<RunReport, PipelineError> {
        let Fetched { input, previous } = self.fetch(run).await?;
        let bootstrap = previous.is_none();

        let scored = self.score(run, input);
        let outcome = self.diff(run, previous.as_ref().map(|p| &p.snapshot), &scored.snapshot);

        let (outcome, published) = match mode {
            RunMode::DryRun => {
                tracing::info!(
                    run_id = %run.run_id,
                    changes = outcome.feed.changes.len(),
                    "Dry run, skipping publication"
                );
                (outcome, None)
            }
            RunMode::Commit => {
                let published = self.publish(run, previous, &scored.snapshot, outcome).await?;
                (published.outcome, Some(published.receipt))
            }
        };

        run.advance(RunState::Done);

        Ok(RunReport {
            run_id: run.run_id.clone(),
            mode,
            state: run.state(),
            transitions: run.transitions().to_vec(),
            bootstrap,
            snapshot_id: outcome.feed.snapshot_id.clone(),
            nodes: outcome.snapshot.nodes.len(),
            suspicious: outcome.snapshot.count_status(Status::Suspicious),
            malicious: outcome.snapshot.count_status(Status::Malicious),
            feed: outcome.feed,
            warnings: scored.warnings,
            published,
        })
    }

    /// Fetching: read the input graph and the previous snapshot.
    pub async fn fetch(&self, run: &mut PipelineRun) -> Result<Fetched, PipelineError> {
        run.advance(RunState::Fetching);

        let input = self.source.fetch_input().await?;
        let previous = self.output.fetch_snapshot().await?;

        tracing::info!(
            run_id = %run.run_id,
            nodes = input.nodes.len(),
            edges = input.edges.len(),
            bootstrap = previous.is_none(),
            "Fetched input graph"
        );

        Ok(Fetched { input, previous })
    }

    /// Scoring: score the input graph into the current snapshot.
    pub fn score(&self, run: &mut PipelineRun, input: InputGraph) -> ScoredGraph {
        run.advance(RunState::Scoring);
        let scored = self.scorer.score_graph(input, run.started_at);

        if !scored.warnings.is_empty() {
            tracing::warn!(
                run_id = %run.run_id,
                degraded = scored.warnings.len(),
                "Scoring degraded for some nodes"
            );
        }
        scored
    }

    /// Diffing: compare the current snapshot against the previous one.
    pub fn diff(&self, run: &mut PipelineRun, previous: Option<&Snapshot>, current: &Snapshot) -> DiffOutcome {
        run.advance(RunState::Diffing);
        let stamp = RunStamp::new(run.run_id.clone(), run.started_at);
        let outcome = self.computator.diff(previous, current, &stamp);

        tracing::info!(
            run_id = %run.run_id,
            changes = outcome.feed.changes.len(),
            crossings = outcome.feed.threshold_crossings().count(),
            snapshot_id = %outcome.feed.snapshot_id,
            "Computed delta feed"
        );
        outcome
    }

    /// Publishing: write every artifact, retrying within the budget.
    ///
    /// `current` is the scored snapshot the outcome was diffed from; it is
    /// re-diffed if the previous snapshot moved on.
    pub async fn publish(
        &self,
        run: &mut PipelineRun,
        previous: Option<PublishedSnapshot>,
        current: &Snapshot,
        outcome: DiffOutcome,
    ) -> Result<Published, PipelineError> {
        run.advance(RunState::Publishing);

        let mut attempt = PublishAttempt::new(previous, outcome)?;
        let mut attempts = 0u32;
        let mut conflicts = 0u32;

        loop {
            attempts += 1;

            let result = if attempt.stale {
                self.refresh(run, &mut attempt, current, &mut conflicts).await
            } else {
                Ok(())
            };
            let result = match result {
                Ok(()) => self.write_all(&mut attempt).await.map_err(PipelineError::from),
                Err(e) => Err(e),
            };

            match result {
                Ok(snapshot_revision) => {
                    let run_id = attempt.outcome.feed.run_id.clone();
                    let receipt = PublishReceipt {
                        history_path: self.output.paths().history_path(&run_id),
                        run_id,
                        snapshot_revision,
                        attempts,
                        conflicts,
                        superseded: attempt.progress.superseded,
                    };
                    tracing::info!(
                        run_id = %receipt.run_id,
                        attempts,
                        conflicts,
                        changes = attempt.outcome.feed.changes.len(),
                        event_seq = attempt.outcome.feed.event_seq,
                        superseded = receipt.superseded,
                        "Published delta feed"
                    );
                    return Ok(Published {
                        outcome: attempt.outcome,
                        receipt,
                    });
                }
                Err(PipelineError::Store(e)) if e.is_retryable() => {
                    if attempts > self.max_retries {
                        return Err(PipelineError::RetryBudgetExceeded { attempts, last: e });
                    }
                    if e.is_conflict() && attempt.progress.snapshot.is_none() {
                        tracing::warn!(run_id = %run.run_id, attempt = attempts, error = %e, "Publish conflict, re-diffing");
                        attempt.stale = true;
                    } else if e.is_conflict() {
                        tracing::warn!(run_id = %run.run_id, attempt = attempts, error = %e, "Pointer conflict, re-checking snapshot");
                    } else {
                        tracing::warn!(run_id = %run.run_id, attempt = attempts, error = %e, "Transient publish failure, retrying write");
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-fetch the snapshot after a conflict and re-diff against it.
    async fn refresh(
        &self,
        run: &PipelineRun,
        attempt: &mut PublishAttempt,
        current: &Snapshot,
        conflicts: &mut u32,
    ) -> Result<(), PipelineError> {
        let fresh = self.output.fetch_snapshot().await?;

        // A snapshot write reported as failed may still have landed.
        if let Some(found) = fresh.as_ref().filter(|f| f.content == attempt.snapshot_bytes) {
            tracing::info!(run_id = %attempt.outcome.feed.run_id, "Snapshot write had been applied");
            attempt.progress.snapshot = Some(found.revision.clone());
            attempt.stale = false;
            return Ok(());
        }

        *conflicts += 1;
        let stamp = RunStamp::new(run.run_id.for_retry(*conflicts), Utc::now());
        let outcome = self
            .computator
            .diff(fresh.as_ref().map(|f| &f.snapshot), current, &stamp);

        tracing::info!(
            run_id = %stamp.run_id,
            changes = outcome.feed.changes.len(),
            "Re-diffed against refreshed snapshot"
        );

        *attempt = PublishAttempt::new(fresh, outcome)?;
        Ok(())
    }

    /// Write the artifacts not yet written by this attempt.
    async fn write_all(&self, attempt: &mut PublishAttempt) -> Result<RevisionTag, StoreError> {
        if !attempt.progress.history {
            self.output
                .write_history(&attempt.outcome.feed.run_id, attempt.feed_bytes.clone())
                .await?;
            attempt.progress.history = true;
        }

        let revision = match &attempt.progress.snapshot {
            Some(revision) => revision.clone(),
            None => {
                let expected = attempt.previous.as_ref().map(|p| &p.revision);
                let revision = self
                    .output
                    .write_snapshot(attempt.snapshot_bytes.clone(), expected)
                    .await?;
                attempt.progress.snapshot = Some(revision.clone());
                revision
            }
        };

        if attempt.progress.latest && attempt.progress.state {
            return Ok(revision);
        }

        // Pointer revisions are read before the snapshot check, so a newer
        // run that commits after the check moves them and our writes conflict.
        let paths = self.output.paths();
        let latest_at = if attempt.progress.latest {
            None
        } else {
            self.output.revision_of(&paths.latest_delta).await?
        };
        let state_at = if attempt.progress.state {
            None
        } else {
            self.output.revision_of(&paths.state_index).await?
        };

        if self.output.revision_of(&paths.snapshot).await?.as_ref() != Some(&revision) {
            tracing::warn!(
                run_id = %attempt.outcome.feed.run_id,
                "Snapshot superseded by a newer run, leaving pointers to it"
            );
            attempt.progress.latest = true;
            attempt.progress.state = true;
            attempt.progress.superseded = true;
            return Ok(revision);
        }

        if !attempt.progress.latest {
            self.output
                .write_latest_delta(attempt.feed_bytes.clone(), latest_at.as_ref())
                .await?;
            attempt.progress.latest = true;
        }

        if !attempt.progress.state {
            self.output
                .write_state(attempt.state_bytes.clone(), state_at.as_ref())
                .await?;
            attempt.progress.state = true;
        }

        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StorePaths;
    use crate::scorer::StaticScorer;
    use crate::store::memory::StoreFault;
    use crate::store::InMemoryContentStore;
    use crate::types::ChangeReason;

    const INPUT: &str = "Data/network_topology.json";
    const SNAPSHOT: &str = "Data/network_topology_scored.json";

    fn orchestrator(
        store: Arc<InMemoryContentStore>,
        scorer: StaticScorer,
    ) -> PublicationOrchestrator<InMemoryContentStore> {
        PublicationOrchestrator::from_config(
            store.clone(),
            store,
            Arc::new(scorer),
            &PipelineConfig::default(),
            false,
        )
        .unwrap()
    }

    fn seeded_store() -> Arc<InMemoryContentStore> {
        let store = Arc::new(InMemoryContentStore::new());
        store.insert(
            INPUT,
            br#"{"nodes":[{"id":"n1"},{"id":"n2"}],"edges":[{"source":"n1","target":"n2"}]}"#.to_vec(),
        );
        store
    }

    fn scorer(n1: f64, n2: f64) -> StaticScorer {
        StaticScorer::new().with_score("n1", n1).with_score("n2", n2)
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = seeded_store();
        let report = orchestrator(store.clone(), scorer(0.1, 0.9))
            .run(RunMode::DryRun)
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Done);
        assert_eq!(
            report.transitions,
            vec![RunState::Fetching, RunState::Scoring, RunState::Diffing, RunState::Done]
        );
        assert!(report.bootstrap);
        assert_eq!(report.feed.changes.len(), 2);
        assert!(report.published.is_none());
        assert!(store.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_commit_write_order() {
        let store = seeded_store();
        let report = orchestrator(store.clone(), scorer(0.1, 0.9))
            .run(RunMode::Commit)
            .await
            .unwrap();

        let receipt = report.published.unwrap();
        assert_eq!(receipt.attempts, 1);
        assert_eq!(
            store.write_log(),
            vec![
                receipt.history_path.clone(),
                SNAPSHOT.to_string(),
                "Data/changes/latest.json".to_string(),
                "Data/state/index.json".to_string(),
            ]
        );
        assert!(report.feed.changes.iter().all(|c| c.reason == ChangeReason::Created));
        assert_eq!(report.feed.changes[1].curr_status(), Some(Status::Malicious));
        assert_eq!((report.nodes, report.suspicious, report.malicious), (2, 0, 1));
        assert!(!receipt.superseded);
    }

    #[tokio::test]
    async fn test_malformed_input_fails_before_writes() {
        let store = Arc::new(InMemoryContentStore::new());
        store.insert(INPUT, b"{ not json".to_vec());

        let failure = orchestrator(store.clone(), scorer(0.1, 0.1))
            .run(RunMode::Commit)
            .await
            .unwrap_err();

        assert_eq!(failure.state, RunState::Fetching);
        assert_eq!(failure.report().kind, "MalformedInput");
        assert!(store.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_transient_snapshot_write_is_retried() {
        let store = seeded_store();
        store.inject_put_fault(SNAPSHOT, StoreFault::Transient);

        let report = orchestrator(store.clone(), scorer(0.1, 0.9))
            .run(RunMode::Commit)
            .await
            .unwrap();

        let receipt = report.published.unwrap();
        assert_eq!(receipt.attempts, 2);
        assert_eq!(receipt.conflicts, 0);
        assert_eq!(receipt.run_id, report.run_id);
        // History was written once, not repeated.
        assert_eq!(store.paths_under("Data/changes/history").len(), 1);
    }

    #[tokio::test]
    async fn test_applied_write_reported_as_failed() {
        let store = seeded_store();
        store.inject_put_fault(SNAPSHOT, StoreFault::TransientAfterApply);

        let report = orchestrator(store.clone(), scorer(0.1, 0.9))
            .run(RunMode::Commit)
            .await
            .unwrap();

        let receipt = report.published.unwrap();
        assert_eq!(receipt.conflicts, 0);
        assert_eq!(report.feed.changes.len(), 2);
        assert_eq!(store.revision(SNAPSHOT), Some(receipt.snapshot_revision));
    }

    #[tokio::test]
    async fn test_retry_budget_exceeded() {
        let store = seeded_store();
        for _ in 0..4 {
            store.inject_put_fault(SNAPSHOT, StoreFault::Transient);
        }

        let failure = orchestrator(store.clone(), scorer(0.1, 0.9))
            .run(RunMode::Commit)
            .await
            .unwrap_err();

        assert_eq!(failure.state, RunState::Publishing);
        assert!(matches!(failure.error, PipelineError::RetryBudgetExceeded { attempts: 4, .. }));
        assert_eq!(failure.report().kind, "RetryBudgetExceeded");
        // Only the orphaned history object was written.
        assert!(store.contents(SNAPSHOT).is_none());
        assert_eq!(store.write_log().len(), 1);
    }

    #[tokio::test]
    async fn test_stepped_conflict_rediffs() {
        let store = seeded_store();
        let slow = orchestrator(store.clone(), scorer(0.9, 0.9));
        let fast = orchestrator(store.clone(), scorer(0.1, 0.1));

        let mut run = slow.start_run();
        let fetched = slow.fetch(&mut run).await.unwrap();
        let scored = slow.score(&mut run, fetched.input);
        let outcome = slow.diff(&mut run, None, &scored.snapshot);

        fast.run(RunMode::Commit).await.unwrap();

        let published = slow
            .publish(&mut run, fetched.previous, &scored.snapshot, outcome)
            .await
            .unwrap();

        assert_eq!(published.receipt.attempts, 2);
        assert_eq!(published.receipt.conflicts, 1);
        assert_eq!(published.receipt.run_id, run.run_id.for_retry(1));
        let reasons: Vec<ChangeReason> = published.outcome.feed.changes.iter().map(|c| c.reason).collect();
        assert_eq!(reasons, vec![ChangeReason::StatusChange, ChangeReason::StatusChange]);
        assert!(published.outcome.snapshot.nodes.iter().all(|n| n.version == 2));
    }

    #[test]
    fn test_safe_mode_paths() {
        let store = Arc::new(InMemoryContentStore::new());
        let orch = PublicationOrchestrator::from_config(
            store.clone(),
            store,
            Arc::new(StaticScorer::new()),
            &PipelineConfig::default(),
            true,
        )
        .unwrap();
        assert_eq!(orch.output().paths(), &StorePaths::default().isolated("Data/safe"));
    }
}
