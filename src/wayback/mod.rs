//! Wayback Machine snapshot client: index queries and raw capture retrieval.

mod cdx;

pub use cdx::{is_at_or_before, parse_cdx_response, CdxQuery, CdxRow, CDX_FIELDS};

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::importer::RateLimiter;
use crate::retry::{with_backoff, RetryPolicy, Retryable};

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The index could not be reached or returned something unreadable.
    #[error("snapshot index unavailable: {0}")]
    IndexUnavailable(String),
    /// The capture does not exist; retrying will not help.
    #[error("capture not found: {url} at {timestamp} ({reason})")]
    CaptureNotFound {
        url: String,
        timestamp: String,
        reason: String,
    },
    #[error("transient fetch error: {0}")]
    TransientFetch(String),
}

impl Retryable for SnapshotError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::IndexUnavailable(_) | Self::TransientFetch(_))
    }
}

/// Kind of raw content to retrieve for a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// The archived page as rendered HTML.
    Rendered,
    /// Raw image bytes.
    Image,
}

impl CaptureKind {
    /// URL modifier appended to the capture timestamp.
    #[must_use]
    pub fn modifier(&self) -> &'static str {
        match self {
            Self::Rendered => "",
            Self::Image => "im_",
        }
    }
}

/// Rate-limited Wayback Machine client.
pub struct WaybackClient {
    client: Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    after_date: Option<String>,
    discovery_limit: u32,
}

impl WaybackClient {
    /// Create a new Wayback client sharing the given rate limiter.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(&config.user_agent)
            .gzip(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.wayback_base_url.trim_end_matches('/').to_string(),
            limiter,
            retry: RetryPolicy::new(config.retry_base_delay),
            after_date: config.after_date.clone(),
            discovery_limit: config.discovery_limit,
        })
    }

    /// Archive URL serving `url` as captured at `timestamp`.
    #[must_use]
    pub fn capture_url(&self, url: &str, timestamp: &str, kind: CaptureKind) -> String {
        format!(
            "{}/web/{}{}/{}",
            self.base_url,
            timestamp,
            kind.modifier(),
            url
        )
    }

    /// List successful HTML captures under `domain` taken on or before `before_date`.
    ///
    /// Every capture is returned, not one per URL: the index collapses a URL
    /// to its oldest capture, so choosing the latest is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::IndexUnavailable`] once retries are exhausted.
    pub async fn find_captures(
        &self,
        domain: &str,
        before_date: &str,
    ) -> Result<Vec<CdxRow>, SnapshotError> {
        let domain = domain.trim().trim_end_matches('/');
        let mut query = CdxQuery::new(format!("{domain}/*"))
            .match_type("prefix")
            .filter("statuscode:200")
            .filter("mimetype:text/html")
            .to_date(before_date)
            .limit(self.discovery_limit);
        if let Some(after) = &self.after_date {
            query = query.from_date(after);
        }

        let rows = self.query_index(&query).await?;
        Ok(rows
            .into_iter()
            .filter(|row| is_at_or_before(&row.timestamp, before_date))
            .collect())
    }

    /// Latest successful capture of `url` at or before `at_or_before`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::IndexUnavailable`] once retries are exhausted.
    pub async fn find_image_capture(
        &self,
        url: &str,
        at_or_before: &str,
    ) -> Result<Option<String>, SnapshotError> {
        let query = CdxQuery::new(url)
            .filter("statuscode:200")
            .to_date(at_or_before);

        let rows = self.query_index(&query).await?;
        Ok(rows
            .into_iter()
            .map(|row| row.timestamp)
            .filter(|ts| is_at_or_before(ts, at_or_before))
            .max())
    }

    /// Retrieve the raw bytes of a capture.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::CaptureNotFound`] for permanent failures and
    /// [`SnapshotError::TransientFetch`] once retries are exhausted.
    pub async fn fetch_capture(
        &self,
        url: &str,
        timestamp: &str,
        kind: CaptureKind,
    ) -> Result<Vec<u8>, SnapshotError> {
        let capture_url = self.capture_url(url, timestamp, kind);

        with_backoff(&self.retry, "fetch_capture", || async {
            self.limiter.acquire().await;
            debug!(url = %capture_url, "Fetching capture");

            let response = self
                .client
                .get(&capture_url)
                .send()
                .await
                .map_err(|e| SnapshotError::TransientFetch(format!("{capture_url}: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(classify_capture_status(status, url, timestamp));
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| SnapshotError::TransientFetch(format!("{capture_url}: {e}")))?;
            Ok(bytes.to_vec())
        })
        .await
    }

    async fn query_index(&self, query: &CdxQuery) -> Result<Vec<CdxRow>, SnapshotError> {
        let index_url = format!("{}/cdx/search/cdx", self.base_url);

        with_backoff(&self.retry, "query_index", || async {
            self.limiter.acquire().await;
            debug!(url = %index_url, params = ?query.params(), "Querying snapshot index");

            let response = self
                .client
                .get(&index_url)
                .query(query.params())
                .send()
                .await
                .map_err(|e| SnapshotError::IndexUnavailable(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(SnapshotError::IndexUnavailable(format!(
                    "index returned {status}"
                )));
            }

            let body = response
                .text()
                .await
                .map_err(|e| SnapshotError::IndexUnavailable(e.to_string()))?;

            parse_cdx_response(&body)
                .map_err(|e| SnapshotError::IndexUnavailable(format!("malformed response: {e}")))
        })
        .await
    }
}

/// Map a non-success capture response onto the error taxonomy.
fn classify_capture_status(status: StatusCode, url: &str, timestamp: &str) -> SnapshotError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SnapshotError::TransientFetch(format!("{url} at {timestamp}: archive returned {status}"))
    } else {
        SnapshotError::CaptureNotFound {
            url: url.to_string(),
            timestamp: timestamp.to_string(),
            reason: format!("archive returned {status}"),
        }
    }
}
