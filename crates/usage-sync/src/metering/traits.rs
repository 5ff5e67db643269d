//! Metering source trait.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;

use super::models::RawUsageEntry;
use crate::error::MeteringError;
use crate::registry::VolumeSpec;

/// Lazy sequence of raw entries for one volume.
pub type EntryStream<'a> = BoxStream<'a, Result<RawUsageEntry, MeteringError>>;

/// Source of raw usage entries for a volume.
///
/// Each call to [`fetch`](MeteringSource::fetch) starts a fresh query; no
/// pagination state survives between calls.
#[async_trait]
pub trait MeteringSource: Send + Sync {
    /// Source name for logs (e.g., "http").
    fn name(&self) -> &'static str;

    /// Stream every entry for `volume`, page by page.
    fn fetch<'a>(&'a self, volume: &'a VolumeSpec) -> EntryStream<'a>;

    /// Collect the full entry sequence for `volume`.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while paging.
    async fn fetch_all(&self, volume: &VolumeSpec) -> Result<Vec<RawUsageEntry>, MeteringError> {
        self.fetch(volume).try_collect().await
    }
}
