//! Canonical usage record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::VolumeId;

/// One project-user measurement on a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub project_identifier: String,
    pub username: String,
    pub volume: VolumeId,
    pub bytes_used: u64,
    pub file_count: u64,
    pub collected_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Supersession key: at most one live measurement per key.
    #[must_use]
    pub fn key(&self) -> (&str, &str, &VolumeId) {
        (&self.project_identifier, &self.username, &self.volume)
    }
}

const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Render a byte count as a value and binary unit, e.g. `("1.50", "GiB")`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn humanize_bytes(bytes: u64) -> (String, &'static str) {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        (bytes.to_string(), UNITS[0])
    } else {
        (format!("{value:.2}"), UNITS[unit])
    }
}
