//! Raw entry normalization.
//!
//! Each [`RawUsageEntry`] variant has its own conversion into a
//! [`UsageRecord`]. Entries that cannot be mapped are dropped and counted;
//! one bad row never fails a volume.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::metering::{QuotaEntry, RawUsageEntry, StarfishEntry};
use crate::record::UsageRecord;
use crate::registry::{VolumeId, VolumeSpec};

/// Largest byte or file count the destination store can hold.
const MAX_STORED: u64 = i64::MAX.unsigned_abs();

/// Why an entry was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Skip {
    MissingField(&'static str),
    BadValue(&'static str),
}

/// Dropped-entry counters for one normalization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounts {
    /// Entries without a project identifier or username.
    pub missing_field: usize,
    /// Entries whose usage or file count was unreadable or out of range.
    pub bad_value: usize,
    /// Entries replaced by a later measurement for the same key.
    pub superseded: usize,
}

impl SkipCounts {
    /// Entries that could not be mapped at all.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.missing_field + self.bad_value
    }
}

/// Result of normalizing one volume's entries.
#[derive(Debug, Clone, Default)]
pub struct NormalizeOutcome {
    pub records: Vec<UsageRecord>,
    pub skipped: SkipCounts,
}

/// Maps raw metering entries onto canonical usage records.
#[derive(Debug, Clone, Copy)]
pub struct RecordNormalizer {
    collected_at: DateTime<Utc>,
}

impl RecordNormalizer {
    /// `collected_at` stamps entries that carry no measurement time of their own.
    #[must_use]
    pub fn new(collected_at: DateTime<Utc>) -> Self {
        Self { collected_at }
    }

    /// Normalize `entries` for `volume`.
    ///
    /// Output keeps first-seen order. A later measurement for the same
    /// (project, user) replaces an earlier one in place.
    pub fn normalize<I>(&self, volume: &VolumeSpec, entries: I) -> NormalizeOutcome
    where
        I: IntoIterator<Item = RawUsageEntry>,
    {
        let volume_id = volume.id();
        let mut outcome = NormalizeOutcome::default();
        let mut positions: HashMap<(String, String), usize> = HashMap::new();

        for entry in entries {
            let converted = match entry {
                RawUsageEntry::Starfish(entry) => self.convert_starfish(&volume_id, entry),
                RawUsageEntry::QuotaReport(entry) => self.convert_quota(&volume_id, entry),
            };

            let record = match converted {
                Ok(record) => record,
                Err(Skip::MissingField(field)) => {
                    debug!(volume = %volume_id, field, "Dropping entry with missing field");
                    outcome.skipped.missing_field += 1;
                    continue;
                }
                Err(Skip::BadValue(field)) => {
                    debug!(volume = %volume_id, field, "Dropping entry with unparseable value");
                    outcome.skipped.bad_value += 1;
                    continue;
                }
            };

            let key = (record.project_identifier.clone(), record.username.clone());
            if let Some(&index) = positions.get(&key) {
                outcome.skipped.superseded += 1;
                if record.collected_at >= outcome.records[index].collected_at {
                    outcome.records[index] = record;
                }
            } else {
                positions.insert(key, outcome.records.len());
                outcome.records.push(record);
            }
        }

        outcome
    }

    fn convert_starfish(&self, volume: &VolumeId, entry: StarfishEntry) -> Result<UsageRecord, Skip> {
        let project = required(entry.groupname, "groupname")?;
        let username = required(entry.username, "username")?;

        let bytes_used = match (&entry.size_sum, &entry.size_sum_hum) {
            (Some(size), _) => parse_bytes(size),
            (None, Some(human)) => parse_size(human),
            (None, None) => None,
        }
        .and_then(storable)
        .ok_or(Skip::BadValue("size_sum"))?;
        let file_count = count_field(entry.count.as_ref(), "count")?;

        Ok(UsageRecord {
            project_identifier: project,
            username,
            volume: volume.clone(),
            bytes_used,
            file_count,
            collected_at: self.collected_at,
        })
    }

    fn convert_quota(&self, volume: &VolumeId, entry: QuotaEntry) -> Result<UsageRecord, Skip> {
        let project = required(entry.project, "project")?;
        let username = required(entry.owner, "owner")?;
        let bytes_used = entry
            .used
            .as_ref()
            .and_then(parse_bytes)
            .and_then(storable)
            .ok_or(Skip::BadValue("used"))?;
        let file_count = count_field(entry.inodes.as_ref(), "inodes")?;

        let collected_at = entry
            .measured_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map_or(self.collected_at, |ts| ts.with_timezone(&Utc));

        Ok(UsageRecord {
            project_identifier: project,
            username,
            volume: volume.clone(),
            bytes_used,
            file_count,
            collected_at,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, Skip> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(Skip::MissingField(field))
}

fn storable(value: u64) -> Option<u64> {
    (value <= MAX_STORED).then_some(value)
}

/// A missing or unreadable count is 0. A count the store cannot hold drops
/// the entry.
fn count_field(value: Option<&Value>, field: &'static str) -> Result<u64, Skip> {
    match value.and_then(parse_count) {
        Some(count) => storable(count).ok_or(Skip::BadValue(field)),
        None => Ok(0),
    }
}

/// Read a byte count from a JSON number or size string.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_bytes(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f.round() as u64)
        }),
        Value::String(s) => parse_size(s),
        _ => None,
    }
}

fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a size string such as `"1024"`, `"1.5T"`, `"20 GiB"` or `"512K"`.
///
/// Suffixes are binary multiples regardless of spelling. Exponent notation
/// is not accepted: `"1e3"` is `None`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    if number.is_empty() {
        return None;
    }

    let exponent = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 1,
        "m" | "mb" | "mib" => 2,
        "g" | "gb" | "gib" => 3,
        "t" | "tb" | "tib" => 4,
        "p" | "pb" | "pib" => 5,
        "e" | "eb" | "eib" => 6,
        _ => return None,
    };

    if exponent == 0 {
        if let Ok(bytes) = number.parse::<u64>() {
            return Some(bytes);
        }
    }

    let value: f64 = number.parse().ok()?;
    let bytes = value * 1024f64.powi(exponent);
    (bytes.is_finite() && bytes >= 0.0 && bytes < u64::MAX as f64).then(|| bytes.round() as u64)
}
