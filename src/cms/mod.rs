//! WordPress REST client for drafts and media.
//!
//! Authenticates with an application password over basic auth. Every request
//! waits on the shared rate limiter and retryable failures (5xx, 429,
//! transport errors) go through [`with_backoff`].

use std::sync::Arc;

use anyhow::Context;
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::importer::RateLimiter;
use crate::retry::{with_backoff, RetryPolicy, Retryable};

/// Maximum number of response body characters kept in an error message.
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Error)]
pub enum CmsError {
    /// Credentials were refused. Nothing else will succeed either.
    #[error("CMS rejected credentials ({status}): {body}")]
    Unauthorized { status: StatusCode, body: String },
    #[error("CMS server error ({status}): {body}")]
    Server { status: StatusCode, body: String },
    #[error("CMS rejected request ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("CMS request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected CMS response: {0}")]
    Decode(String),
}

impl CmsError {
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

impl Retryable for CmsError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Server { .. } | Self::Transport(_))
    }
}

/// Fields of a new draft post.
#[derive(Debug, Clone, Serialize)]
pub struct NewDraft {
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_gmt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub featured_media: Option<i64>,
    pub categories: Vec<u64>,
}

#[derive(Serialize)]
struct DraftBody<'a> {
    #[serde(flatten)]
    draft: &'a NewDraft,
    status: &'static str,
}

/// A created draft.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedPost {
    pub id: i64,
    pub link: String,
}

/// An uploaded media item.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedMedia {
    pub id: i64,
    pub source_url: String,
}

#[derive(Debug, Deserialize)]
struct PostWithContent {
    content: RawContent,
}

#[derive(Debug, Deserialize)]
struct RawContent {
    raw: Option<String>,
    #[serde(default)]
    rendered: String,
}

#[derive(Serialize)]
struct ContentUpdate<'a> {
    content: &'a str,
}

/// WordPress REST API client.
pub struct WordPressClient {
    client: Client,
    api_base: String,
    username: String,
    app_password: String,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl WordPressClient {
    /// Create a new client sharing the given rate limiter.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(&config.user_agent)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_base: format!("{}/wp-json/wp/v2", config.wp_url.trim_end_matches('/')),
            username: config.wp_username.clone(),
            app_password: config.wp_app_password.clone(),
            limiter,
            retry: RetryPolicy::new(config.retry_base_delay),
        })
    }

    /// Create a draft post.
    ///
    /// # Errors
    ///
    /// Returns a [`CmsError`] if the post could not be created.
    pub async fn create_draft(&self, draft: &NewDraft) -> Result<CreatedPost, CmsError> {
        let url = format!("{}/posts", self.api_base);
        let body = DraftBody {
            draft,
            status: "draft",
        };

        let post: CreatedPost = self
            .send_json("create_draft", || self.client.post(&url).json(&body))
            .await?;
        info!(post_id = post.id, link = %post.link, "Created draft");
        Ok(post)
    }

    /// Upload an image, attaching `alt_text` to the media item.
    ///
    /// # Errors
    ///
    /// Returns a [`CmsError`] if the upload failed.
    pub async fn upload_media(
        &self,
        data: &[u8],
        filename: &str,
        content_type: &str,
        alt_text: &str,
    ) -> Result<UploadedMedia, CmsError> {
        let url = format!("{}/media", self.api_base);

        let media: UploadedMedia = self
            .send_json("upload_media", || {
                // Forms are consumed on send, so each attempt builds its own.
                let mut form =
                    multipart::Form::new().part("file", media_part(data, filename, content_type));
                if !alt_text.is_empty() {
                    form = form.text("alt_text", alt_text.to_string());
                }
                self.client.post(&url).multipart(form)
            })
            .await?;
        debug!(media_id = media.id, filename = %filename, "Uploaded media");
        Ok(media)
    }

    /// Current raw content of a post.
    ///
    /// # Errors
    ///
    /// Returns a [`CmsError`] if the post could not be read.
    pub async fn get_post_content(&self, post_id: i64) -> Result<String, CmsError> {
        let url = format!("{}/posts/{post_id}", self.api_base);

        let post: PostWithContent = self
            .send_json("get_post_content", || {
                self.client.get(&url).query(&[("context", "edit")])
            })
            .await?;
        Ok(post.content.raw.unwrap_or(post.content.rendered))
    }

    /// Replace a post's content.
    ///
    /// # Errors
    ///
    /// Returns a [`CmsError`] if the update failed.
    pub async fn update_post_content(&self, post_id: i64, content: &str) -> Result<(), CmsError> {
        let url = format!("{}/posts/{post_id}", self.api_base);
        let body = ContentUpdate { content };

        let _: serde_json::Value = self
            .send_json("update_post_content", || self.client.post(&url).json(&body))
            .await?;
        debug!(post_id, "Updated post content");
        Ok(())
    }

    async fn send_json<T, F>(&self, what: &str, build: F) -> Result<T, CmsError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        with_backoff(&self.retry, what, || async {
            self.limiter.acquire().await;
            let response = build()
                .basic_auth(&self.username, Some(&self.app_password))
                .send()
                .await?;
            let response = check_status(response).await?;
            response
                .json::<T>()
                .await
                .map_err(|e| CmsError::Decode(e.to_string()))
        })
        .await
    }
}

fn media_part(data: &[u8], filename: &str, content_type: &str) -> multipart::Part {
    let part = || multipart::Part::bytes(data.to_vec()).file_name(filename.to_string());
    part().mime_str(content_type).unwrap_or_else(|_| part())
}

/// Turn a non-success response into the matching [`CmsError`].
async fn check_status(response: Response) -> Result<Response, CmsError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    let body = truncate(&body, MAX_ERROR_BODY);

    Err(classify_status(status, body))
}

fn classify_status(status: StatusCode, body: String) -> CmsError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CmsError::Unauthorized { status, body },
        StatusCode::TOO_MANY_REQUESTS => CmsError::Server { status, body },
        s if s.is_server_error() => CmsError::Server { status, body },
        _ => CmsError::Rejected { status, body },
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
