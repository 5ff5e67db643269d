//! Error taxonomy for the synchronization pipeline.
//!
//! Each component owns a narrow error enum. [`SyncError`] rolls them up so the
//! orchestrator can capture any per-volume failure into a
//! [`RunResult`](crate::orchestrator::RunResult) without losing its kind.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration document is not valid JSON or has the wrong shape.
    #[error("malformed server configuration: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A server entry failed validation.
    #[error("server '{server}': {reason}")]
    InvalidServer { server: String, reason: String },

    /// A requested volume is not declared by any server.
    #[error("volume '{0}' is not declared by any configured server")]
    UnknownVolume(String),

    /// The configuration resolved to no volumes at all.
    #[error("no volumes configured")]
    Empty,

    /// A required environment variable is missing.
    #[error("{0} environment variable not set")]
    MissingEnv(&'static str),

    /// An environment variable holds an unparseable value.
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Errors raised by the metering service client.
#[derive(Error, Debug)]
pub enum MeteringError {
    /// Credentials were rejected. Never retried.
    #[error("metering authentication failed: {0}")]
    Auth(String),

    /// Transient failures persisted past the retry ceiling.
    #[error("metering service unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    /// A response did not have the expected shape.
    #[error("metering protocol error: {0}")]
    Protocol(String),
}

/// Errors raised by the snapshot store.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Filesystem operation failed.
    #[error("snapshot I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot content could not be encoded or decoded.
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Snapshot does not exist (never written, or already deleted).
    #[error("snapshot not found: {0}")]
    NotFound(PathBuf),

    /// Operation is not allowed in the snapshot's current state.
    #[error("precondition failed: {0}")]
    Precondition(String),
}

impl SnapshotError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path)
        } else {
            Self::Io { path, source }
        }
    }
}

/// Errors raised by a destination store implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached (connection-level failure).
    #[error("destination store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected an operation.
    #[error("destination store error: {0}")]
    Backend(String),

    /// Store lock was poisoned by a panicking writer.
    #[error("destination store lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(
                ErrorCode::CannotOpen
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase,
            ) => Self::Unavailable(err.to_string()),
            _ => Self::Backend(err.to_string()),
        }
    }
}

/// Errors raised while committing a snapshot.
#[derive(Error, Debug)]
pub enum CommitError {
    /// The snapshot could not be read.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// The destination store failed; nothing from this snapshot is durable.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A per-volume pipeline failure.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metering(#[from] MeteringError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Commit(#[from] CommitError),
}

/// Coarse error category, used in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    MeteringAuth,
    MeteringUnavailable,
    MeteringProtocol,
    Snapshot,
    Precondition,
    Commit,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Config => "ConfigError",
            Self::MeteringAuth => "MeteringAuthError",
            Self::MeteringUnavailable => "MeteringUnavailable",
            Self::MeteringProtocol => "MeteringProtocolError",
            Self::Snapshot => "SnapshotError",
            Self::Precondition => "PreconditionError",
            Self::Commit => "CommitError",
        };
        f.write_str(name)
    }
}

impl SyncError {
    /// Category of this failure.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Metering(MeteringError::Auth(_)) => ErrorKind::MeteringAuth,
            Self::Metering(MeteringError::Unavailable { .. }) => ErrorKind::MeteringUnavailable,
            Self::Metering(MeteringError::Protocol(_)) => ErrorKind::MeteringProtocol,
            Self::Snapshot(SnapshotError::Precondition(_)) => ErrorKind::Precondition,
            Self::Snapshot(_) => ErrorKind::Snapshot,
            Self::Commit(_) => ErrorKind::Commit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = SyncError::from(MeteringError::Unavailable {
            attempts: 4,
            last_error: "HTTP 503".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::MeteringUnavailable);
        assert_eq!(err.kind().to_string(), "MeteringUnavailable");

        let err = SyncError::from(SnapshotError::Precondition("not committed".to_string()));
        assert_eq!(err.kind(), ErrorKind::Precondition);

        let err = SyncError::from(CommitError::from(StoreError::Unavailable(
            "connection refused".to_string(),
        )));
        assert_eq!(err.kind(), ErrorKind::Commit);
    }

    #[test]
    fn test_snapshot_io_not_found_maps_to_not_found() {
        let err = SnapshotError::io(
            "/tmp/missing.json",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(err, SnapshotError::NotFound(_)));
    }
}
