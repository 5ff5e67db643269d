//! Destination store for allocation usage.
//!
//! [`UsageStore`] is the seam the committer writes through.
//! [`SqliteUsageStore`] is the bundled implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::record::humanize_bytes;
use crate::registry::VolumeId;

/// Idempotent DDL for destination tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS allocation_usage (
    project_id INTEGER NOT NULL REFERENCES projects(id),
    user_id INTEGER NOT NULL REFERENCES users(id),
    server TEXT NOT NULL,
    volume TEXT NOT NULL,
    usage_bytes INTEGER NOT NULL,
    file_count INTEGER NOT NULL,
    usage TEXT NOT NULL,
    unit TEXT NOT NULL,
    collected_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (project_id, user_id, server, volume)
);

CREATE TABLE IF NOT EXISTS missing_identities (
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    PRIMARY KEY (kind, name)
);
";

/// Replaces a row only when the incoming measurement is not older.
const UPSERT_USAGE: &str = r"
INSERT INTO allocation_usage
    (project_id, user_id, server, volume, usage_bytes, file_count, usage, unit, collected_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT (project_id, user_id, server, volume) DO UPDATE SET
    usage_bytes = excluded.usage_bytes,
    file_count = excluded.file_count,
    usage = excluded.usage,
    unit = excluded.unit,
    collected_at = excluded.collected_at,
    updated_at = excluded.updated_at
WHERE excluded.collected_at >= allocation_usage.collected_at
";

/// Kind of identity a usage record could not be matched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Project,
    User,
}

impl IdentityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::User => "user",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "project" => Some(Self::Project),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// A resolved usage measurement ready to upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRow {
    pub project_id: i64,
    pub user_id: i64,
    pub volume: VolumeId,
    pub bytes_used: u64,
    pub file_count: u64,
    pub collected_at: DateTime<Utc>,
}

/// A stored usage row, read back with identity names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationUsage {
    pub project: String,
    pub username: String,
    pub volume: VolumeId,
    pub usage_bytes: u64,
    pub file_count: u64,
    pub usage: String,
    pub unit: String,
    pub collected_at: DateTime<Utc>,
}

/// An identity seen in metering data but absent from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingIdentity {
    pub kind: IdentityKind,
    pub name: String,
    pub last_seen: DateTime<Utc>,
}

/// Destination store contract.
pub trait UsageStore: Send + Sync {
    /// Map project titles to ids. Unknown titles are absent from the result.
    fn lookup_projects(&self, titles: &[&str]) -> Result<HashMap<String, i64>, StoreError>;

    /// Map usernames to ids. Unknown usernames are absent from the result.
    fn lookup_users(&self, usernames: &[&str]) -> Result<HashMap<String, i64>, StoreError>;

    /// Upsert `rows` in a single transaction. Returns how many rows changed;
    /// rows older than what is already stored are left alone.
    fn upsert_usage(&self, rows: &[UsageRow]) -> Result<usize, StoreError>;

    /// Log identities that could not be resolved.
    fn record_missing(
        &self,
        kind: IdentityKind,
        names: &[&str],
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Stored usage for one volume, ordered by project then user.
    fn usage_for(&self, volume: &VolumeId) -> Result<Vec<AllocationUsage>, StoreError>;
}

/// `SQLite`-backed destination store.
///
/// Create with [`SqliteUsageStore::open`] for a database file or
/// [`SqliteUsageStore::in_memory`] for tests.
pub struct SqliteUsageStore {
    conn: Mutex<Connection>,
}

impl SqliteUsageStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Register a project, returning its id. Existing titles keep their id.
    pub fn add_project(&self, title: &str) -> Result<i64, StoreError> {
        self.add_identity(
            "INSERT OR IGNORE INTO projects (title) VALUES (?1)",
            "SELECT id FROM projects WHERE title = ?1",
            title,
        )
    }

    /// Register a user, returning its id. Existing usernames keep their id.
    pub fn add_user(&self, username: &str) -> Result<i64, StoreError> {
        self.add_identity(
            "INSERT OR IGNORE INTO users (username) VALUES (?1)",
            "SELECT id FROM users WHERE username = ?1",
            username,
        )
    }

    fn add_identity(&self, insert: &str, select: &str, name: &str) -> Result<i64, StoreError> {
        let conn = self.lock_conn()?;
        conn.execute(insert, [name])?;
        Ok(conn.query_row(select, [name], |row| row.get(0))?)
    }

    /// Every logged missing identity, ordered by kind then name.
    pub fn missing_identities(&self) -> Result<Vec<MissingIdentity>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT kind, name, last_seen FROM missing_identities ORDER BY kind, name")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut missing = Vec::new();
        for row in rows {
            let (kind, name, last_seen) = row?;
            let kind = IdentityKind::parse(&kind)
                .ok_or_else(|| StoreError::Backend(format!("unknown identity kind '{kind}'")))?;
            missing.push(MissingIdentity {
                kind,
                name,
                last_seen: parse_timestamp(&last_seen)?,
            });
        }
        Ok(missing)
    }

    fn lookup(&self, query: &str, names: &[&str]) -> Result<HashMap<String, i64>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare_cached(query)?;
        let mut ids = HashMap::new();
        for name in names {
            if let Some(id) = stmt.query_row([name], |row| row.get(0)).optional()? {
                ids.insert((*name).to_string(), id);
            }
        }
        Ok(ids)
    }
}

impl UsageStore for SqliteUsageStore {
    fn lookup_projects(&self, titles: &[&str]) -> Result<HashMap<String, i64>, StoreError> {
        self.lookup("SELECT id FROM projects WHERE title = ?1", titles)
    }

    fn lookup_users(&self, usernames: &[&str]) -> Result<HashMap<String, i64>, StoreError> {
        self.lookup("SELECT id FROM users WHERE username = ?1", usernames)
    }

    fn upsert_usage(&self, rows: &[UsageRow]) -> Result<usize, StoreError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let updated_at = format_timestamp(Utc::now());
        let mut changed = 0;
        {
            let mut stmt = tx.prepare_cached(UPSERT_USAGE)?;
            for row in rows {
                let (usage, unit) = humanize_bytes(row.bytes_used);
                changed += stmt.execute(params![
                    row.project_id,
                    row.user_id,
                    row.volume.server,
                    row.volume.volume,
                    to_sql_int(row.bytes_used)?,
                    to_sql_int(row.file_count)?,
                    usage,
                    unit,
                    format_timestamp(row.collected_at),
                    updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn record_missing(
        &self,
        kind: IdentityKind,
        names: &[&str],
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO missing_identities (kind, name, last_seen) VALUES (?1, ?2, ?3)
                 ON CONFLICT (kind, name) DO UPDATE SET last_seen = excluded.last_seen",
            )?;
            let seen_at = format_timestamp(seen_at);
            for name in names {
                stmt.execute(params![kind.as_str(), name, seen_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn usage_for(&self, volume: &VolumeId) -> Result<Vec<AllocationUsage>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT p.title, u.username, a.usage_bytes, a.file_count, a.usage, a.unit, a.collected_at
             FROM allocation_usage a
             JOIN projects p ON p.id = a.project_id
             JOIN users u ON u.id = a.user_id
             WHERE a.server = ?1 AND a.volume = ?2
             ORDER BY p.title, u.username",
        )?;
        let rows = stmt.query_map(params![volume.server, volume.volume], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut usage = Vec::new();
        for row in rows {
            let (project, username, bytes, files, rendered, unit, collected_at) = row?;
            usage.push(AllocationUsage {
                project,
                username,
                volume: volume.clone(),
                usage_bytes: from_sql_int(bytes)?,
                file_count: from_sql_int(files)?,
                usage: rendered,
                unit,
                collected_at: parse_timestamp(&collected_at)?,
            });
        }
        Ok(usage)
    }
}

/// Fixed-width RFC 3339 so text comparison matches time order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp '{raw}': {e}")))
}

fn to_sql_int(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Backend(format!("{value} exceeds INTEGER range")))
}

fn from_sql_int(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Backend(format!("negative count {value}")))
}
