//! Runtime configuration for the sync pipeline.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Metering service username.
pub const ENV_USERNAME: &str = "METERING_USERNAME";
/// Metering service password.
pub const ENV_PASSWORD: &str = "METERING_PASSWORD";
/// Path to the server/volume registry JSON.
pub const ENV_SERVERS: &str = "USAGE_SYNC_SERVERS";
/// Directory holding intermediate snapshots.
pub const ENV_SNAPSHOT_DIR: &str = "USAGE_SYNC_SNAPSHOT_DIR";
/// Path to the destination SQLite database.
pub const ENV_DATABASE: &str = "USAGE_SYNC_DATABASE";
/// Retry ceiling for transient metering failures.
pub const ENV_MAX_RETRIES: &str = "USAGE_SYNC_MAX_RETRIES";
/// Per-request HTTP timeout in seconds.
pub const ENV_HTTP_TIMEOUT: &str = "USAGE_SYNC_HTTP_TIMEOUT_SECS";
/// Number of volumes staged concurrently.
pub const ENV_CONCURRENCY: &str = "USAGE_SYNC_CONCURRENCY";
/// Age (hours) under which a pending snapshot is reused instead of re-querying.
/// `0` disables reuse.
pub const ENV_REUSE_HOURS: &str = "USAGE_SYNC_REUSE_HOURS";

pub const DEFAULT_SERVERS_PATH: &str = "servers.json";
pub const DEFAULT_SNAPSHOT_DIR: &str = "data/snapshots";
pub const DEFAULT_DATABASE_PATH: &str = "data/usage.db";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_REUSE_HOURS: u64 = 48;

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Total attempts, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Metering service credentials.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration for a sync run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub credentials: Credentials,
    pub servers_path: PathBuf,
    pub snapshot_dir: PathBuf,
    pub database_path: PathBuf,
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
    /// Interval between async query status checks.
    pub poll_interval: Duration,
    /// Status checks before an async query is considered stuck.
    pub max_polls: u32,
    /// Entries requested per result page.
    pub page_size: usize,
    /// Volumes staged (fetch, normalize, snapshot) at once.
    pub fetch_concurrency: usize,
    /// Pending snapshots younger than this are committed instead of re-fetched.
    pub reuse_window: Option<chrono::Duration>,
}

impl SyncConfig {
    /// Build a configuration with defaults for everything but credentials.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            servers_path: PathBuf::from(DEFAULT_SERVERS_PATH),
            snapshot_dir: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            retry: RetryPolicy::default(),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(3),
            max_polls: 200,
            page_size: 10_000,
            fetch_concurrency: 1,
            reuse_window: reuse_window_hours(DEFAULT_REUSE_HOURS),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `METERING_USERNAME`, `METERING_PASSWORD`
    ///
    /// # Optional Environment Variables
    /// - `USAGE_SYNC_SERVERS` (default: servers.json)
    /// - `USAGE_SYNC_SNAPSHOT_DIR` (default: data/snapshots)
    /// - `USAGE_SYNC_DATABASE` (default: data/usage.db)
    /// - `USAGE_SYNC_MAX_RETRIES` (default: 3)
    /// - `USAGE_SYNC_HTTP_TIMEOUT_SECS` (default: 60)
    /// - `USAGE_SYNC_CONCURRENCY` (default: 1)
    /// - `USAGE_SYNC_REUSE_HOURS` (default: 48, 0 disables)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let username = lookup(ENV_USERNAME).ok_or(ConfigError::MissingEnv(ENV_USERNAME))?;
        let password = lookup(ENV_PASSWORD).ok_or(ConfigError::MissingEnv(ENV_PASSWORD))?;
        let mut config = Self::new(Credentials { username, password });

        if let Some(path) = lookup(ENV_SERVERS) {
            config.servers_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup(ENV_SNAPSHOT_DIR) {
            config.snapshot_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup(ENV_DATABASE) {
            config.database_path = PathBuf::from(path);
        }
        if let Some(retries) = parse_env::<u32, _>(&lookup, ENV_MAX_RETRIES)? {
            config.retry.max_retries = retries;
        }
        if let Some(secs) = parse_env::<u64, _>(&lookup, ENV_HTTP_TIMEOUT)? {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(concurrency) = parse_env::<usize, _>(&lookup, ENV_CONCURRENCY)? {
            config.fetch_concurrency = concurrency.max(1);
        }
        if let Some(hours) = parse_env::<u64, _>(&lookup, ENV_REUSE_HOURS)? {
            config.reuse_window = reuse_window_hours(hours);
        }

        Ok(config)
    }
}

/// Path from environment variable `name`, or `default`.
///
/// For commands that only touch local files and need no credentials.
#[must_use]
pub fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var_os(name).map_or_else(|| PathBuf::from(default), PathBuf::from)
}

fn reuse_window_hours(hours: u64) -> Option<chrono::Duration> {
    if hours == 0 {
        None
    } else {
        i64::try_from(hours).ok().map(chrono::Duration::hours)
    }
}

fn parse_env<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&'static str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
    }
}
