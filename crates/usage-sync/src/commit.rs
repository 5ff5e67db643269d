//! Snapshot commit into the destination store.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::CommitError;
use crate::snapshot::{SnapshotHandle, SnapshotStore};
use crate::store::{IdentityKind, UsageRow, UsageStore};

/// Counts from one commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    /// Records written (or confirmed) in the destination store.
    pub committed: usize,
    /// Records skipped because their project is unknown.
    pub unresolved_projects: usize,
    /// Records skipped because their user is unknown (project was known).
    pub unresolved_users: usize,
}

impl CommitOutcome {
    #[must_use]
    pub fn unresolved(&self) -> usize {
        self.unresolved_projects + self.unresolved_users
    }
}

/// Upserts snapshot records keyed by (project, user, volume).
#[derive(Clone)]
pub struct Committer {
    store: Arc<dyn UsageStore>,
    snapshots: SnapshotStore,
}

impl Committer {
    pub fn new(store: Arc<dyn UsageStore>, snapshots: SnapshotStore) -> Self {
        Self { store, snapshots }
    }

    /// Commit every resolvable record in `handle`.
    ///
    /// The upsert is one transaction: on error nothing from this snapshot is
    /// durable. Committing the same snapshot again leaves the store unchanged.
    #[instrument(skip(self, handle), fields(volume = %handle.volume, run_id = %handle.run_id))]
    pub fn commit(&self, handle: &SnapshotHandle) -> Result<CommitOutcome, CommitError> {
        let records = self.snapshots.read(handle)?;

        let titles: BTreeSet<&str> = records.iter().map(|r| r.project_identifier.as_str()).collect();
        let usernames: BTreeSet<&str> = records.iter().map(|r| r.username.as_str()).collect();
        let projects = self
            .store
            .lookup_projects(&titles.iter().copied().collect::<Vec<_>>())?;
        let users = self
            .store
            .lookup_users(&usernames.iter().copied().collect::<Vec<_>>())?;

        let mut outcome = CommitOutcome::default();
        let mut missing_projects = BTreeSet::new();
        let mut missing_users = BTreeSet::new();
        let mut rows = Vec::with_capacity(records.len());

        for record in &records {
            let project_id = projects.get(&record.project_identifier);
            let user_id = users.get(&record.username);
            if project_id.is_none() {
                missing_projects.insert(record.project_identifier.as_str());
            }
            if user_id.is_none() {
                missing_users.insert(record.username.as_str());
            }

            match (project_id, user_id) {
                (Some(&project_id), Some(&user_id)) => rows.push(UsageRow {
                    project_id,
                    user_id,
                    volume: record.volume.clone(),
                    bytes_used: record.bytes_used,
                    file_count: record.file_count,
                    collected_at: record.collected_at,
                }),
                (None, _) => outcome.unresolved_projects += 1,
                (Some(_), None) => outcome.unresolved_users += 1,
            }
        }

        let changed = self.store.upsert_usage(&rows)?;
        outcome.committed = rows.len();
        debug!(changed, "Upserted usage rows");

        let now = Utc::now();
        for (kind, names) in [
            (IdentityKind::Project, &missing_projects),
            (IdentityKind::User, &missing_users),
        ] {
            if names.is_empty() {
                continue;
            }
            let names: Vec<&str> = names.iter().copied().collect();
            if let Err(e) = self.store.record_missing(kind, &names, now) {
                warn!(kind = kind.as_str(), error = %e, "Failed to log missing identities");
            }
        }

        info!(
            committed = outcome.committed,
            unresolved_projects = outcome.unresolved_projects,
            unresolved_users = outcome.unresolved_users,
            "Committed snapshot"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::record::UsageRecord;
    use crate::registry::VolumeId;
    use crate::store::testing::UnavailableStore;
    use crate::store::SqliteUsageStore;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record(project: &str, user: &str, bytes: u64, hour: u32) -> UsageRecord {
        UsageRecord {
            project_identifier: project.to_string(),
            username: user.to_string(),
            volume: VolumeId::new("A", "v1"),
            bytes_used: bytes,
            file_count: 1,
            collected_at: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
        }
    }

    fn setup() -> (TempDir, Arc<SqliteUsageStore>, SnapshotStore, Committer) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteUsageStore::in_memory().unwrap());
        store.add_project("lab_a").unwrap();
        store.add_user("alice").unwrap();
        store.add_user("bob").unwrap();
        let snapshots = SnapshotStore::new(dir.path());
        let committer = Committer::new(store.clone(), snapshots.clone());
        (dir, store, snapshots, committer)
    }

    #[test]
    fn test_commit_is_idempotent() {
        let (_dir, store, snapshots, committer) = setup();
        let volume = VolumeId::new("A", "v1");
        let handle = snapshots
            .write(&volume, "run-1", &[record("lab_a", "alice", 100, 10), record("lab_a", "bob", 200, 10)])
            .unwrap();

        let first = committer.commit(&handle).unwrap();
        let before = store.usage_for(&volume).unwrap();
        let second = committer.commit(&handle).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.committed, 2);
        assert_eq!(store.usage_for(&volume).unwrap(), before);
    }

    #[test]
    fn test_later_snapshot_supersedes_earlier() {
        let (_dir, store, snapshots, committer) = setup();
        let volume = VolumeId::new("A", "v1");
        let early = snapshots
            .write(&volume, "run-1", &[record("lab_a", "alice", 100, 10)])
            .unwrap();
        let late = snapshots
            .write(&volume, "run-2", &[record("lab_a", "alice", 900, 11)])
            .unwrap();

        committer.commit(&late).unwrap();
        committer.commit(&early).unwrap();

        let usage = store.usage_for(&volume).unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].usage_bytes, 900);
    }

    #[test]
    fn test_unresolved_identities_are_skipped_and_logged() {
        let (_dir, store, snapshots, committer) = setup();
        let handle = snapshots
            .write(
                &VolumeId::new("A", "v1"),
                "run-1",
                &[
                    record("lab_a", "alice", 1, 10),
                    record("lab_a", "ghost", 2, 10),
                    record("lab_x", "alice", 3, 10),
                ],
            )
            .unwrap();

        let outcome = committer.commit(&handle).unwrap();
        assert_eq!(outcome.committed, 1);
        assert_eq!(outcome.unresolved_users, 1);
        assert_eq!(outcome.unresolved_projects, 1);

        let names: Vec<_> = store
            .missing_identities()
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["lab_x".to_string(), "ghost".to_string()]);
    }

    #[test]
    fn test_store_outage_is_commit_error() {
        let dir = TempDir::new().unwrap();
        let snapshots = SnapshotStore::new(dir.path());
        let handle = snapshots
            .write(&VolumeId::new("A", "v1"), "run-1", &[record("lab_a", "alice", 1, 10)])
            .unwrap();
        let committer = Committer::new(Arc::new(UnavailableStore), snapshots.clone());

        let err = committer.commit(&handle).unwrap_err();
        assert!(matches!(err, CommitError::Store(StoreError::Unavailable(_))));
        assert!(!snapshots.is_committed(&handle));
    }
}
