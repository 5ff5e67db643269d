//! Metering service access.
//!
//! Two server schemas are supported:
//!
//! - **Starfish** - async query API. Submit a grouped query, wait for it to
//!   finish, then page through the result with `limit`/`offset`.
//! - **Quota report** - cursor-paginated quota listing behind HTTP basic auth.
//!
//! Both produce [`RawUsageEntry`] values tagged by schema; interpretation is
//! left to the [`normalize`](crate::normalize) module.

mod client;
mod models;
mod traits;

pub use client::MeteringClient;
pub use models::{QuotaEntry, RawUsageEntry, StarfishEntry};
pub use traits::{EntryStream, MeteringSource};
