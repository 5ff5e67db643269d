//! Metering service wire models.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Starfish async query API
// ============================================================================

/// Response to `POST async/query/`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryCreated {
    pub query_id: String,
}

/// Response to `GET async/query/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryStatus {
    pub is_done: bool,
}

/// One row of a Starfish query grouped by username and groupname.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StarfishEntry {
    /// Owning user.
    #[serde(default)]
    pub username: Option<String>,
    /// Owning group, which is the project (lab) name.
    #[serde(default)]
    pub groupname: Option<String>,
    /// Total size in bytes. Number or numeric string.
    #[serde(default)]
    pub size_sum: Option<Value>,
    /// Human-readable size, e.g. `"1.5 GiB"`.
    #[serde(default)]
    pub size_sum_hum: Option<String>,
    /// Number of files.
    #[serde(default)]
    pub count: Option<Value>,
}

// ============================================================================
// Quota report API
// ============================================================================

/// One page of `GET api/v1/quotas`.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaPage {
    pub entries: Vec<Value>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// One quota report row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QuotaEntry {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    /// Bytes used. Number of bytes, or a size string such as `"1.5T"`.
    #[serde(default)]
    pub used: Option<Value>,
    #[serde(default)]
    pub inodes: Option<Value>,
    /// RFC 3339 measurement time.
    #[serde(default)]
    pub measured_at: Option<String>,
}

// ============================================================================
// Raw entries
// ============================================================================

/// Server-specific usage entry, tagged by the schema that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawUsageEntry {
    Starfish(StarfishEntry),
    QuotaReport(QuotaEntry),
}
