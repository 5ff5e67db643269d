//! Storage usage synchronization.
//!
//! Pulls per-user, per-project disk usage from metering services, normalizes
//! it into [`UsageRecord`]s, keeps a durable snapshot per volume per run, and
//! commits the snapshot into an allocation usage store.
//!
//! ## Pipeline
//!
//! ```text
//! VolumeRegistry -> MeteringClient -> RecordNormalizer -> SnapshotStore -> Committer -> UsageStore
//! ```
//!
//! A volume that fails anywhere along the way is reported in its
//! [`RunResult`] and the run continues with the next volume. Snapshots that
//! were written but not committed stay on disk and are picked up by
//! [`SyncOrchestrator::retry_pending`] or by the next run.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let summary = usage_sync::scheduled_sync().await?;
//!     print!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod commit;
pub mod config;
pub mod error;
pub mod metering;
pub mod normalize;
pub mod orchestrator;
pub mod record;
pub mod registry;
pub mod snapshot;
pub mod store;

use std::sync::Arc;

use anyhow::Context;

pub use commit::{CommitOutcome, Committer};
pub use config::{Credentials, RetryPolicy, SyncConfig};
pub use error::{
    CommitError, ConfigError, ErrorKind, MeteringError, SnapshotError, StoreError, SyncError,
};
pub use metering::{MeteringClient, MeteringSource, RawUsageEntry};
pub use normalize::{NormalizeOutcome, RecordNormalizer, SkipCounts};
pub use orchestrator::{RunResult, RunStatus, RunSummary, SyncOptions, SyncOrchestrator};
pub use record::UsageRecord;
pub use registry::{ServerKind, VolumeId, VolumeRegistry, VolumeSpec};
pub use snapshot::{SnapshotHandle, SnapshotStore};
pub use store::{SqliteUsageStore, UsageStore};

/// Wire up the HTTP metering client, the `SQLite` store and the snapshot
/// directory named by `config`.
pub fn build_orchestrator(config: &SyncConfig) -> anyhow::Result<SyncOrchestrator> {
    let client = MeteringClient::new(config).context("failed to create metering client")?;
    let store = SqliteUsageStore::open(&config.database_path).with_context(|| {
        format!(
            "failed to open usage store at {}",
            config.database_path.display()
        )
    })?;

    Ok(SyncOrchestrator::new(
        Arc::new(client),
        Arc::new(store),
        SnapshotStore::new(&config.snapshot_dir),
        SyncOptions::from(config),
    ))
}

/// Sync every configured volume, with everything read from the environment.
///
/// Intended for schedulers. Each call builds its own clients and run id, so
/// overlapping calls do not share state.
pub async fn scheduled_sync() -> anyhow::Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let registry = VolumeRegistry::load(&config.servers_path)?;
    let orchestrator = build_orchestrator(&config)?;
    Ok(orchestrator.run(registry.volumes(), false).await)
}
