//! HTTP client for the metering service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::models::{
    QueryCreated, QueryStatus, QuotaEntry, QuotaPage, RawUsageEntry, StarfishEntry,
};
use super::traits::{EntryStream, MeteringSource};
use crate::config::{Credentials, RetryPolicy, SyncConfig};
use crate::error::{ConfigError, MeteringError};
use crate::registry::{ServerKind, VolumeSpec};

const USER_AGENT: &str = concat!("usage-sync/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 200;

enum StarfishCursor {
    Submit,
    Results {
        token: String,
        query_id: String,
        offset: usize,
    },
    Done,
}

enum QuotaCursor {
    First,
    Next(String),
    Done,
}

/// Authenticated metering API client.
///
/// Bearer tokens are exchanged once per server and cached for the lifetime of
/// the client. A rejected token is dropped from the cache so the next volume
/// on that server authenticates again. Each server has its own token slot, so
/// a slow exchange with one server does not hold up the others.
pub struct MeteringClient {
    client: Client,
    credentials: Credentials,
    retry: RetryPolicy,
    poll_interval: Duration,
    max_polls: u32,
    page_size: usize,
    tokens: Mutex<HashMap<String, TokenSlot>>,
}

type TokenSlot = Arc<Mutex<Option<String>>>;

impl MeteringClient {
    /// Create a client from sync configuration.
    pub fn new(config: &SyncConfig) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            credentials: config.credentials.clone(),
            retry: config.retry,
            poll_interval: config.poll_interval,
            max_polls: config.max_polls.max(1),
            page_size: config.page_size.max(1),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn api_url(volume: &VolumeSpec, endpoint: &str) -> String {
        format!(
            "{}/api/{endpoint}",
            volume.endpoint_url.as_str().trim_end_matches('/')
        )
    }

    /// `volumes_and_paths` values for a Starfish query.
    fn volume_paths(volume: &VolumeSpec) -> Vec<String> {
        if volume.paths.is_empty() {
            vec![format!("{}:", volume.volume_name)]
        } else {
            volume
                .paths
                .iter()
                .map(|path| format!("{}:{path}", volume.volume_name))
                .collect()
        }
    }

    /// Send a request, retrying transient failures with bounded backoff.
    async fn send<F>(&self, op: &'static str, build: F) -> Result<Response, MeteringError>
    where
        F: Fn() -> RequestBuilder,
    {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let (last_error, hinted_delay) = match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(MeteringError::Auth(format!("{op}: HTTP {status}")));
                    }
                    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        (format!("{op}: HTTP {status}"), retry_after(&response))
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(MeteringError::Protocol(format!(
                            "{op}: unexpected HTTP {status}: {}",
                            truncate(&body)
                        )));
                    }
                }
                Err(e) if is_transient(&e) => (format!("{op}: {e}"), None),
                Err(e) => return Err(MeteringError::Protocol(format!("{op}: {e}"))),
            };

            if attempt >= max_attempts {
                return Err(MeteringError::Unavailable {
                    attempts: attempt,
                    last_error,
                });
            }

            let delay = self.retry_delay(attempt, hinted_delay);
            warn!(
                op,
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %last_error,
                "Transient metering failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Backoff before the next attempt. A server `Retry-After` hint can
    /// lengthen the wait but never past `max_delay`.
    fn retry_delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let backoff = self.retry.delay_for(attempt);
        hint.map_or(backoff, |hint| hint.max(backoff))
            .min(self.retry.max_delay)
    }

    async fn decode<T>(response: Response, op: &str) -> Result<T, MeteringError>
    where
        T: DeserializeOwned,
    {
        let body = response
            .text()
            .await
            .map_err(|e| MeteringError::Protocol(format!("{op}: failed to read body: {e}")))?;
        serde_json::from_str(&body)
            .map_err(|e| MeteringError::Protocol(format!("{op}: unexpected response shape: {e}")))
    }

    // ------------------------------------------------------------------------
    // Starfish
    // ------------------------------------------------------------------------

    async fn token_slot(&self, server: &str) -> TokenSlot {
        self.tokens
            .lock()
            .await
            .entry(server.to_string())
            .or_default()
            .clone()
    }

    /// Exchange credentials for a bearer token, once per server.
    #[instrument(skip(self, volume), fields(server = %volume.server_name))]
    async fn bearer_token(&self, volume: &VolumeSpec) -> Result<String, MeteringError> {
        let slot = self.token_slot(&volume.server_name).await;
        let mut cached = slot.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let url = Self::api_url(volume, "auth/");
        let body = json!({
            "username": self.credentials.username,
            "password": self.credentials.password,
        });
        let response = self
            .send("auth", || self.client.post(&url).json(&body))
            .await?;
        let value: Value = Self::decode(response, "auth").await?;
        let token = value
            .get("token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| MeteringError::Auth("token exchange returned no token".to_string()))?
            .to_string();

        debug!("Obtained metering token");
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Authorized JSON call against a Starfish server.
    async fn starfish_call<T>(
        &self,
        volume: &VolumeSpec,
        token: &str,
        method: Method,
        op: &'static str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, MeteringError>
    where
        T: DeserializeOwned,
    {
        let result = match self
            .send(op, || {
                self.client
                    .request(method.clone(), url)
                    .bearer_auth(token)
                    .header(ACCEPT, "application/json")
                    .query(query)
            })
            .await
        {
            Ok(response) => Self::decode(response, op).await,
            Err(e) => Err(e),
        };

        if let Err(MeteringError::Auth(_)) = &result {
            let slot = self.token_slot(&volume.server_name).await;
            let mut cached = slot.lock().await;
            if cached.as_deref() == Some(token) {
                *cached = None;
            }
        }
        result
    }

    async fn submit_query(&self, volume: &VolumeSpec, token: &str) -> Result<String, MeteringError> {
        let mut params: Vec<(&str, String)> = Self::volume_paths(volume)
            .into_iter()
            .map(|vp| ("volumes_and_paths", vp))
            .collect();
        params.extend([
            ("queries", "type=f".to_string()),
            ("group_by", "username,groupname".to_string()),
            ("sort_by", "username,groupname".to_string()),
            ("format", "username groupname size_sum count".to_string()),
            ("output_format", "json".to_string()),
            ("size_unit", "B".to_string()),
            ("force_tag_inherit", "false".to_string()),
            ("humanize_nested", "false".to_string()),
        ]);

        let url = Self::api_url(volume, "async/query/");
        let created: QueryCreated = self
            .starfish_call(volume, token, Method::POST, "submit_query", &url, &params)
            .await?;
        debug!(query_id = %created.query_id, "Submitted usage query");
        Ok(created.query_id)
    }

    async fn wait_for_query(
        &self,
        volume: &VolumeSpec,
        token: &str,
        query_id: &str,
    ) -> Result<(), MeteringError> {
        let url = Self::api_url(volume, &format!("async/query/{query_id}"));

        for check in 1..=self.max_polls {
            let status: QueryStatus = self
                .starfish_call(volume, token, Method::GET, "query_status", &url, &[])
                .await?;
            if status.is_done {
                debug!(query_id, checks = check, "Usage query complete");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        Err(MeteringError::Unavailable {
            attempts: self.max_polls,
            last_error: format!(
                "query {query_id} not complete after {} status checks",
                self.max_polls
            ),
        })
    }

    async fn result_page(
        &self,
        volume: &VolumeSpec,
        token: &str,
        query_id: &str,
        offset: usize,
    ) -> Result<Vec<RawUsageEntry>, MeteringError> {
        let url = Self::api_url(volume, &format!("async/query_result/{query_id}"));
        let params = [
            ("limit", self.page_size.to_string()),
            ("offset", offset.to_string()),
        ];
        let rows: Value = self
            .starfish_call(volume, token, Method::GET, "query_result", &url, &params)
            .await?;

        let Value::Array(rows) = rows else {
            return Err(MeteringError::Protocol(
                "query_result: expected a JSON array".to_string(),
            ));
        };
        rows.into_iter()
            .map(|row| parse_row::<StarfishEntry>(row, "query_result").map(RawUsageEntry::Starfish))
            .collect()
    }

    fn starfish_stream<'a>(&'a self, volume: &'a VolumeSpec) -> EntryStream<'a> {
        stream::try_unfold(StarfishCursor::Submit, move |cursor| async move {
            let (token, query_id, offset) = match cursor {
                StarfishCursor::Done => return Ok::<_, MeteringError>(None),
                StarfishCursor::Submit => {
                    let token = self.bearer_token(volume).await?;
                    let query_id = self.submit_query(volume, &token).await?;
                    self.wait_for_query(volume, &token, &query_id).await?;
                    (token, query_id, 0)
                }
                StarfishCursor::Results {
                    token,
                    query_id,
                    offset,
                } => (token, query_id, offset),
            };

            let page = self.result_page(volume, &token, &query_id, offset).await?;
            debug!(volume = %volume.id(), offset, rows = page.len(), "Fetched result page");

            let next = if page.len() < self.page_size {
                StarfishCursor::Done
            } else {
                StarfishCursor::Results {
                    token,
                    query_id,
                    offset: offset + page.len(),
                }
            };
            Ok::<_, MeteringError>(Some((page, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, MeteringError>)))
        .try_flatten()
        .boxed()
    }

    // ------------------------------------------------------------------------
    // Quota report
    // ------------------------------------------------------------------------

    async fn quota_page(
        &self,
        volume: &VolumeSpec,
        cursor: Option<&str>,
    ) -> Result<(Vec<RawUsageEntry>, Option<String>), MeteringError> {
        let url = Self::api_url(volume, "v1/quotas");
        let mut params = vec![("volume", volume.volume_name.clone())];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }

        let response = self
            .send("quota_page", || {
                self.client
                    .get(&url)
                    .basic_auth(&self.credentials.username, Some(&self.credentials.password))
                    .header(ACCEPT, "application/json")
                    .query(&params)
            })
            .await?;
        let page: QuotaPage = Self::decode(response, "quota_page").await?;

        let entries = page
            .entries
            .into_iter()
            .map(|row| parse_row::<QuotaEntry>(row, "quota_page").map(RawUsageEntry::QuotaReport))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((entries, page.next_cursor))
    }

    fn quota_stream<'a>(&'a self, volume: &'a VolumeSpec) -> EntryStream<'a> {
        stream::try_unfold(QuotaCursor::First, move |cursor| async move {
            let cursor = match cursor {
                QuotaCursor::Done => return Ok::<_, MeteringError>(None),
                QuotaCursor::First => None,
                QuotaCursor::Next(cursor) => Some(cursor),
            };

            let (page, next_cursor) = self.quota_page(volume, cursor.as_deref()).await?;
            debug!(volume = %volume.id(), rows = page.len(), "Fetched quota page");

            // An empty page ends the report even if the server offers a cursor.
            let next = match next_cursor {
                Some(next) if !page.is_empty() => QuotaCursor::Next(next),
                _ => QuotaCursor::Done,
            };
            Ok::<_, MeteringError>(Some((page, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, MeteringError>)))
        .try_flatten()
        .boxed()
    }
}

#[async_trait]
impl MeteringSource for MeteringClient {
    fn name(&self) -> &'static str {
        "http"
    }

    fn fetch<'a>(&'a self, volume: &'a VolumeSpec) -> EntryStream<'a> {
        debug!(volume = %volume.id(), kind = %volume.kind, "Fetching usage entries");
        match volume.kind {
            ServerKind::Starfish => self.starfish_stream(volume),
            ServerKind::QuotaReport => self.quota_stream(volume),
        }
    }
}

fn parse_row<T>(row: Value, op: &str) -> Result<T, MeteringError>
where
    T: DeserializeOwned,
{
    if !row.is_object() {
        return Err(MeteringError::Protocol(format!(
            "{op}: expected an object row, got {row}"
        )));
    }
    serde_json::from_value(row).map_err(|e| MeteringError::Protocol(format!("{op}: malformed row: {e}")))
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY {
        body.to_string()
    } else {
        let head: String = body.chars().take(MAX_ERROR_BODY).collect();
        format!("{head}...")
    }
}
