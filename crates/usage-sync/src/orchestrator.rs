//! Sync pipeline driver.
//!
//! For each volume: fetch, normalize, snapshot, commit. A failing volume is
//! captured into its [`RunResult`] and the run moves on to the next one.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::commit::Committer;
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SnapshotError, SyncError};
use crate::metering::MeteringSource;
use crate::normalize::RecordNormalizer;
use crate::registry::{VolumeId, VolumeSpec};
use crate::snapshot::{SnapshotHandle, SnapshotStore};
use crate::store::UsageStore;

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Volumes staged (fetch, normalize, snapshot) at once.
    pub fetch_concurrency: usize,
    /// Reuse an uncommitted snapshot younger than this instead of fetching.
    pub reuse_window: Option<chrono::Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            fetch_concurrency: 1,
            reuse_window: None,
        }
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            fetch_concurrency: config.fetch_concurrency.max(1),
            reuse_window: config.reuse_window,
        }
    }
}

/// Final state of one volume in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Snapshot written but not committed; it stays pending for a retry.
    Partial,
    Failed,
    /// Never started because the run was cancelled.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Failure detail attached to a [`RunResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SyncError> for RunError {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome for one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub volume: VolumeId,
    pub status: RunStatus,
    pub records_committed: usize,
    /// Entries dropped by normalization plus records with unknown identities.
    pub records_skipped: usize,
    /// Committed from an existing snapshot rather than a fresh fetch.
    #[serde(default)]
    pub resumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunResult {
    fn new(volume: VolumeId, status: RunStatus) -> Self {
        Self {
            volume,
            status,
            records_committed: 0,
            records_skipped: 0,
            resumed: false,
            error: None,
        }
    }

    fn failed(volume: VolumeId, err: &SyncError) -> Self {
        Self {
            error: Some(err.into()),
            ..Self::new(volume, RunStatus::Failed)
        }
    }
}

/// Results of one run, in volume order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<RunResult>,
}

impl RunSummary {
    /// Number of volumes that reached [`RunStatus::Success`].
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(RunStatus::Success)
    }

    #[must_use]
    pub fn count(&self, status: RunStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// True when there was work and none of it succeeded.
    #[must_use]
    pub fn is_total_loss(&self) -> bool {
        !self.results.is_empty() && self.succeeded() == 0
    }

    #[must_use]
    pub fn records_committed(&self) -> usize {
        self.results.iter().map(|r| r.records_committed).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "run {}: {}/{} volumes succeeded, {} records committed",
            self.run_id,
            self.succeeded(),
            self.results.len(),
            self.records_committed()
        )?;
        for result in &self.results {
            write!(
                f,
                "  {:<24} {:<9} committed={} skipped={}",
                result.volume.to_string(),
                result.status.to_string(),
                result.records_committed,
                result.records_skipped
            )?;
            if result.resumed {
                f.write_str(" (resumed)")?;
            }
            if let Some(error) = &result.error {
                write!(f, " [{}] {}", error.kind, error.message)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Build a run identifier: UTC start time plus a random suffix.
#[must_use]
pub fn new_run_id(started_at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", started_at.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

/// Result of the staging half of the pipeline for one volume.
enum Staged {
    Ready {
        handle: SnapshotHandle,
        dropped: usize,
        resumed: bool,
    },
    Done(RunResult),
}

/// Drives the sync pipeline across volumes.
pub struct SyncOrchestrator {
    source: Arc<dyn MeteringSource>,
    snapshots: SnapshotStore,
    committer: Committer,
    options: SyncOptions,
    cancel: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn MeteringSource>,
        store: Arc<dyn UsageStore>,
        snapshots: SnapshotStore,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            committer: Committer::new(store, snapshots.clone()),
            snapshots,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `token` to stop the run before the next volume starts.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sync `volumes`, committing each in order.
    ///
    /// Never fails as a whole: every per-volume error ends up in the
    /// matching [`RunResult`].
    #[instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub async fn run(&self, volumes: &[Arc<VolumeSpec>], cleanup: bool) -> RunSummary {
        let started_at = Utc::now();
        let run_id = new_run_id(started_at);
        tracing::Span::current().record("run_id", run_id.as_str());
        info!(
            volumes = volumes.len(),
            source = self.source.name(),
            concurrency = self.options.fetch_concurrency,
            "Starting sync run"
        );

        let mut results = Vec::with_capacity(volumes.len());
        let mut staged = stream::iter(volumes.iter().cloned())
            .map(|volume| self.stage(volume, &run_id))
            .buffered(self.options.fetch_concurrency.max(1));

        while let Some(stage) = staged.next().await {
            let result = match stage {
                Staged::Ready {
                    handle,
                    dropped,
                    resumed,
                } => {
                    let mut result = self.finish(&handle, cleanup);
                    result.records_skipped += dropped;
                    result.resumed = resumed;
                    result
                }
                Staged::Done(result) => result,
            };
            log_result(&result);
            results.push(result);
        }
        drop(staged);

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            results,
        };
        info!(
            succeeded = summary.succeeded(),
            failed = summary.count(RunStatus::Failed),
            partial = summary.count(RunStatus::Partial),
            "Sync run finished"
        );
        summary
    }

    /// Commit every pending snapshot, oldest first, without fetching.
    #[instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub fn retry_pending(&self, cleanup: bool) -> Result<RunSummary, SnapshotError> {
        let started_at = Utc::now();
        let run_id = new_run_id(started_at);
        tracing::Span::current().record("run_id", run_id.as_str());

        let mut pending = self.snapshots.pending(None)?;
        pending.reverse();
        info!(pending = pending.len(), "Retrying pending snapshots");

        let mut results = Vec::with_capacity(pending.len());
        for handle in pending {
            let result = if self.cancel.is_cancelled() {
                RunResult::new(handle.volume.clone(), RunStatus::Cancelled)
            } else {
                let mut result = self.finish(&handle, cleanup);
                result.resumed = true;
                result
            };
            log_result(&result);
            results.push(result);
        }

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            results,
        })
    }

    /// Fetch, normalize and snapshot one volume, or pick up a recent
    /// uncommitted snapshot.
    async fn stage(&self, volume: Arc<VolumeSpec>, run_id: &str) -> Staged {
        let id = volume.id();
        if self.cancel.is_cancelled() {
            return Staged::Done(RunResult::new(id, RunStatus::Cancelled));
        }

        if let Some(handle) = self.reusable_snapshot(&id) {
            info!(volume = %id, snapshot = %handle.run_id, "Resuming from pending snapshot");
            return Staged::Ready {
                handle,
                dropped: 0,
                resumed: true,
            };
        }

        let collected_at = Utc::now();
        let entries = match self.source.fetch_all(&volume).await {
            Ok(entries) => entries,
            Err(e) => return Staged::Done(RunResult::failed(id, &SyncError::from(e))),
        };
        let fetched = entries.len();

        let outcome = RecordNormalizer::new(collected_at).normalize(&volume, entries);
        info!(
            volume = %id,
            fetched,
            records = outcome.records.len(),
            missing_field = outcome.skipped.missing_field,
            bad_value = outcome.skipped.bad_value,
            superseded = outcome.skipped.superseded,
            "Normalized entries"
        );

        match self.snapshots.write(&id, run_id, &outcome.records) {
            Ok(handle) => Staged::Ready {
                handle,
                dropped: outcome.skipped.dropped(),
                resumed: false,
            },
            Err(e) => Staged::Done(RunResult::failed(id, &SyncError::from(e))),
        }
    }

    fn reusable_snapshot(&self, volume: &VolumeId) -> Option<SnapshotHandle> {
        let window = self.options.reuse_window?;
        match self.snapshots.pending(Some(volume)) {
            Ok(pending) => pending
                .into_iter()
                .next()
                .filter(|handle| Utc::now() - handle.created_at < window),
            Err(e) => {
                warn!(volume = %volume, error = %e, "Cannot list pending snapshots");
                None
            }
        }
    }

    /// Commit a staged snapshot, then mark and optionally delete it.
    fn finish(&self, handle: &SnapshotHandle, cleanup: bool) -> RunResult {
        let volume = handle.volume.clone();
        let outcome = match self.committer.commit(handle) {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = SyncError::from(e);
                return RunResult {
                    error: Some((&err).into()),
                    ..RunResult::new(volume, RunStatus::Partial)
                };
            }
        };

        let mut result = RunResult {
            records_committed: outcome.committed,
            records_skipped: outcome.unresolved(),
            ..RunResult::new(volume, RunStatus::Success)
        };

        if let Err(e) = self.snapshots.mark_committed(handle) {
            let err = SyncError::from(e);
            result.status = RunStatus::Partial;
            result.error = Some((&err).into());
            return result;
        }

        if cleanup {
            if let Err(e) = self.snapshots.delete(handle) {
                warn!(volume = %handle.volume, error = %e, "Failed to remove committed snapshot");
            }
        }
        result
    }
}

fn log_result(result: &RunResult) {
    match &result.error {
        None => info!(
            volume = %result.volume,
            status = %result.status,
            committed = result.records_committed,
            skipped = result.records_skipped,
            "Volume finished"
        ),
        Some(error) => warn!(
            volume = %result.volume,
            status = %result.status,
            kind = %error.kind,
            error = %error.message,
            "Volume finished with error"
        ),
    }
}
