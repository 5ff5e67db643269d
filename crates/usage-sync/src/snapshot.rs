//! File-backed snapshot store.
//!
//! Layout under the store root:
//!
//! ```text
//! {root}/{server}/{volume}/{run_id}.json        header + normalized records
//! {root}/{server}/{volume}/{run_id}.committed   present once committed
//! ```
//!
//! Server and volume names are percent-encoded into directory names, so two
//! distinct names never share a directory and none escapes the root.
//!
//! Snapshot writes go to a temporary file in the target directory, are
//! fsynced, then renamed into place, so readers never see partial content.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::SnapshotError;
use crate::record::UsageRecord;
use crate::registry::VolumeId;

const SNAPSHOT_EXT: &str = "json";
const MARKER_EXT: &str = "committed";

/// Reference to one written snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub volume: VolumeId,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub record_count: usize,
    pub path: PathBuf,
}

impl SnapshotHandle {
    fn marker_path(&self) -> PathBuf {
        self.path.with_extension(MARKER_EXT)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
    server: String,
    volume: String,
    run_id: String,
    created_at: DateTime<Utc>,
    record_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    header: SnapshotHeader,
    records: Vec<UsageRecord>,
}

/// Durable store of per-volume, per-run snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn volume_dir(&self, volume: &VolumeId) -> PathBuf {
        self.root
            .join(path_component(&volume.server))
            .join(path_component(&volume.volume))
    }

    /// Atomically write `records` as the snapshot for `volume` in run `run_id`.
    pub fn write(
        &self,
        volume: &VolumeId,
        run_id: &str,
        records: &[UsageRecord],
    ) -> Result<SnapshotHandle, SnapshotError> {
        let dir = self.volume_dir(volume);
        fs::create_dir_all(&dir).map_err(|e| SnapshotError::io(&dir, e))?;

        let path = dir.join(format!("{run_id}.{SNAPSHOT_EXT}"));
        let created_at = Utc::now();
        let document = SnapshotDocument {
            header: SnapshotHeader {
                server: volume.server.clone(),
                volume: volume.volume.clone(),
                run_id: run_id.to_string(),
                created_at,
                record_count: records.len(),
            },
            records: records.to_vec(),
        };
        let content = serde_json::to_vec_pretty(&document)?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| SnapshotError::io(&dir, e))?;
        tmp.write_all(&content)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| SnapshotError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| SnapshotError::io(&path, e.error))?;

        debug!(volume = %volume, run_id, records = records.len(), path = %path.display(), "Wrote snapshot");

        Ok(SnapshotHandle {
            volume: volume.clone(),
            run_id: run_id.to_string(),
            created_at,
            record_count: records.len(),
            path,
        })
    }

    /// Read the records of a snapshot.
    pub fn read(&self, handle: &SnapshotHandle) -> Result<Vec<UsageRecord>, SnapshotError> {
        Ok(load_document(&handle.path)?.records)
    }

    /// Record that `handle` has been committed to the destination store.
    pub fn mark_committed(&self, handle: &SnapshotHandle) -> Result<(), SnapshotError> {
        if !handle.path.exists() {
            return Err(SnapshotError::NotFound(handle.path.clone()));
        }
        let marker = handle.marker_path();
        fs::write(&marker, Utc::now().to_rfc3339()).map_err(|e| SnapshotError::io(&marker, e))
    }

    #[must_use]
    pub fn is_committed(&self, handle: &SnapshotHandle) -> bool {
        handle.marker_path().exists()
    }

    /// Delete a committed snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Precondition`] if the snapshot was never
    /// marked committed.
    pub fn delete(&self, handle: &SnapshotHandle) -> Result<(), SnapshotError> {
        if !self.is_committed(handle) {
            return Err(SnapshotError::Precondition(format!(
                "snapshot {} for {} has not been committed",
                handle.run_id, handle.volume
            )));
        }
        fs::remove_file(&handle.path).map_err(|e| SnapshotError::io(&handle.path, e))?;
        let marker = handle.marker_path();
        fs::remove_file(&marker).map_err(|e| SnapshotError::io(&marker, e))?;
        debug!(volume = %handle.volume, run_id = %handle.run_id, "Deleted snapshot");
        Ok(())
    }

    /// Uncommitted snapshots, newest first. Restricted to one volume if given.
    pub fn pending(&self, volume: Option<&VolumeId>) -> Result<Vec<SnapshotHandle>, SnapshotError> {
        let mut pending: Vec<_> = self
            .scan(volume)?
            .into_iter()
            .filter(|handle| !self.is_committed(handle))
            .collect();
        pending.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(pending)
    }

    /// Remove committed snapshots older than `older_than`. Returns how many
    /// were removed. Uncommitted snapshots are never pruned.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Precondition`] if `older_than` reaches past
    /// the earliest representable timestamp.
    pub fn prune(&self, older_than: Duration) -> Result<usize, SnapshotError> {
        let cutoff = Utc::now().checked_sub_signed(older_than).ok_or_else(|| {
            SnapshotError::Precondition(format!(
                "retention of {} days is out of range",
                older_than.num_days()
            ))
        })?;
        let mut removed = 0;
        for handle in self.scan(None)? {
            if handle.created_at < cutoff && self.is_committed(&handle) {
                self.delete(&handle)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Every readable snapshot under the root, or only those whose header
    /// names `volume`.
    fn scan(&self, volume: Option<&VolumeId>) -> Result<Vec<SnapshotHandle>, SnapshotError> {
        let dirs = match volume {
            Some(volume) => vec![self.volume_dir(volume)],
            None => {
                let mut dirs = Vec::new();
                for server_dir in subdirs(&self.root)? {
                    dirs.extend(subdirs(&server_dir)?);
                }
                dirs
            }
        };

        let mut handles = Vec::new();
        for dir in dirs {
            for path in files_with_ext(&dir, SNAPSHOT_EXT)? {
                match load_document(&path) {
                    Ok(document) => {
                        let header = document.header;
                        let id = VolumeId::new(header.server, header.volume);
                        if volume.is_some_and(|wanted| *wanted != id) {
                            warn!(path = %path.display(), found = %id, "Ignoring snapshot filed under another volume");
                            continue;
                        }
                        handles.push(SnapshotHandle {
                            volume: id,
                            run_id: header.run_id,
                            created_at: header.created_at,
                            record_count: header.record_count,
                            path,
                        });
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot"),
                }
            }
        }
        Ok(handles)
    }
}

fn load_document(path: &Path) -> Result<SnapshotDocument, SnapshotError> {
    let content = fs::read_to_string(path).map_err(|e| SnapshotError::io(path, e))?;
    Ok(serde_json::from_str(&content)?)
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, SnapshotError> {
    Ok(read_dir(dir)?.into_iter().filter(|p| p.is_dir()).collect())
}

fn files_with_ext(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, SnapshotError> {
    Ok(read_dir(dir)?
        .into_iter()
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == ext))
        .collect())
}

/// Directory entries, or nothing if the directory does not exist yet.
fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, SnapshotError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SnapshotError::io(dir, e)),
    };
    entries
        .map(|entry| entry.map(|e| e.path()).map_err(|e| SnapshotError::io(dir, e)))
        .collect()
}

/// Encode a server or volume name as a single path component.
///
/// Bytes outside `[A-Za-z0-9_-]` are written as `%XX`, as is a leading `.`,
/// so the mapping is reversible and never yields `.`, `..` or a hidden name.
fn path_component(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_')
            || (byte == b'.' && i > 0);
        if keep {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(user: &str) -> UsageRecord {
        UsageRecord {
            project_identifier: "lab_a".to_string(),
            username: user.to_string(),
            volume: VolumeId::new("A", "v1"),
            bytes_used: 42,
            file_count: 3,
            collected_at: Utc::now(),
        }
    }

    fn store() -> (TempDir, SnapshotStore) {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store) = store();
        let volume = VolumeId::new("A", "v1");
        let records = vec![record("alice"), record("bob")];

        let handle = store.write(&volume, "run-1", &records).unwrap();
        assert_eq!(handle.record_count, 2);
        assert!(handle.path.ends_with("A/v1/run-1.json"));
        assert_eq!(store.read(&handle).unwrap(), records);
    }

    #[test]
    fn test_delete_requires_commit_marker() {
        let (_dir, store) = store();
        let handle = store
            .write(&VolumeId::new("A", "v1"), "run-1", &[record("alice")])
            .unwrap();

        let err = store.delete(&handle).unwrap_err();
        assert!(matches!(err, SnapshotError::Precondition(_)));
        assert!(handle.path.exists());

        store.mark_committed(&handle).unwrap();
        assert!(store.is_committed(&handle));
        store.delete(&handle).unwrap();

        let err = store.read(&handle).unwrap_err();
        assert!(matches!(err, SnapshotError::NotFound(_)));
    }

    #[test]
    fn test_mark_committed_on_missing_snapshot_fails() {
        let (_dir, store) = store();
        let handle = store
            .write(&VolumeId::new("A", "v1"), "run-1", &[])
            .unwrap();
        fs::remove_file(&handle.path).unwrap();
        assert!(matches!(
            store.mark_committed(&handle),
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[test]
    fn test_pending_lists_uncommitted_newest_first() {
        let (_dir, store) = store();
        let v1 = VolumeId::new("A", "v1");
        let v2 = VolumeId::new("B", "v2");

        let older = store.write(&v1, "20240301T000000Z-aaaaaaaa", &[]).unwrap();
        let newer = store.write(&v1, "20240302T000000Z-bbbbbbbb", &[]).unwrap();
        let other = store.write(&v2, "20240302T000000Z-cccccccc", &[]).unwrap();
        store.mark_committed(&other).unwrap();

        let pending = store.pending(None).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].run_id, newer.run_id);
        assert_eq!(pending[1].run_id, older.run_id);

        assert!(store.pending(Some(&v2)).unwrap().is_empty());
    }

    #[test]
    fn test_pending_on_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("never-created"));
        assert!(store.pending(None).unwrap().is_empty());
    }

    #[test]
    fn test_prune_only_removes_committed() {
        let (_dir, store) = store();
        let volume = VolumeId::new("A", "v1");
        let committed = store.write(&volume, "run-1", &[record("alice")]).unwrap();
        let uncommitted = store.write(&volume, "run-2", &[record("bob")]).unwrap();
        store.mark_committed(&committed).unwrap();

        assert_eq!(store.prune(Duration::days(7)).unwrap(), 0);
        assert_eq!(store.prune(Duration::zero()).unwrap(), 1);
        assert!(!committed.path.exists());
        assert!(uncommitted.path.exists());
    }

    #[test]
    fn test_prune_rejects_out_of_range_retention() {
        let (_dir, store) = store();
        let handle = store
            .write(&VolumeId::new("A", "v1"), "run-1", &[record("alice")])
            .unwrap();
        store.mark_committed(&handle).unwrap();

        let err = store
            .prune(Duration::days(i64::from(u32::MAX)))
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Precondition(_)));
        assert!(handle.path.exists());
    }

    #[test]
    fn test_path_component_encoding() {
        assert_eq!(path_component("scratch/lab"), "scratch%2Flab");
        assert_eq!(path_component("scratch_lab"), "scratch_lab");
        assert_eq!(path_component("vol-1.a"), "vol-1.a");
        assert_eq!(path_component(".."), "%2E.");
        assert_eq!(path_component("."), "%2E");
        assert_eq!(path_component("50%"), "50%25");
    }

    #[test]
    fn test_similar_names_do_not_share_snapshots() {
        let (_dir, store) = store();
        let slashed = VolumeId::new("A", "scratch/lab");
        let underscored = VolumeId::new("A", "scratch_lab");

        let handle = store.write(&slashed, "run-1", &[record("alice")]).unwrap();
        assert_ne!(
            handle.path.parent().unwrap(),
            store.volume_dir(&underscored).as_path()
        );

        assert!(store.pending(Some(&underscored)).unwrap().is_empty());
        let pending = store.pending(Some(&slashed)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].volume, slashed);
    }

    #[test]
    fn test_pending_ignores_snapshot_with_foreign_header() {
        let (_dir, store) = store();
        let v1 = VolumeId::new("A", "v1");
        let v2 = VolumeId::new("A", "v2");
        let handle = store.write(&v1, "run-1", &[]).unwrap();

        let misplaced = store.volume_dir(&v2);
        fs::create_dir_all(&misplaced).unwrap();
        fs::copy(&handle.path, misplaced.join("run-1.json")).unwrap();

        assert!(store.pending(Some(&v2)).unwrap().is_empty());
        assert_eq!(store.pending(Some(&v1)).unwrap().len(), 1);
    }

    #[test]
    fn test_dot_names_stay_inside_the_root() {
        let (dir, store) = store();
        let volume = VolumeId::new("A", "..");

        let handle = store.write(&volume, "run-1", &[record("alice")]).unwrap();
        assert!(handle.path.starts_with(dir.path().join("A")));
        assert!(!dir.path().join("run-1.json").exists());

        let pending = store.pending(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].volume, volume);
    }
}
