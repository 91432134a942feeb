//! Page extraction: fetch a rendered capture, pull out the article and its images.

use std::cell::RefCell;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use lol_html::element;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::html::{image_placeholder, rewrite_html, rewrite_image_placeholders};
use crate::constants::{MAX_EXCERPT_CHARS, UNTITLED};
use crate::db::PageRecord;
use crate::wayback::{CaptureKind, SnapshotError, WaybackClient};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("unparseable content: {0}")]
    Unparseable(String),
    #[error("empty content")]
    EmptyContent,
}

/// An image downloaded from the archive, ready for upload.
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub archived_url: String,
    pub original_url: String,
    pub data: Vec<u8>,
    pub alt_text: String,
}

/// Content extracted from one page, consumed by the publisher.
///
/// `body_html` references `images[k]` through the placeholder for `k`.
#[derive(Debug, Clone)]
pub struct ExtractedContent {
    pub title: String,
    pub body_html: String,
    pub excerpt: Option<String>,
    pub published_gmt: Option<String>,
    pub slug: String,
    pub images: Vec<ExtractedImage>,
}

/// An image reference found in the page body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub original_url: String,
    pub alt_text: String,
}

/// Result of parsing a rendered capture, before any image is fetched.
#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub title: String,
    pub body_html: String,
    pub excerpt: Option<String>,
    pub published_gmt: Option<String>,
    pub slug: String,
    pub images: Vec<ImageRef>,
}

/// Heading levels tried for the title, in order.
static HEADINGS: Lazy<Vec<Selector>> = Lazy::new(|| {
    ["h1", "h2", "h3"]
        .iter()
        .map(|s| Selector::parse(s).expect("valid selector"))
        .collect()
});
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("valid selector"));
static META_DESCRIPTION: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="description"]"#).expect("valid selector"));
static TIME: Lazy<Selector> =
    Lazy::new(|| Selector::parse("time[datetime]").expect("valid selector"));

/// Candidate containers for the main content, most specific first.
static CONTENT_CONTAINERS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        "article",
        "main",
        r#"[role="main"]"#,
        ".entry-content",
        ".post-content",
        ".content",
        "body",
    ]
    .iter()
    .map(|s| Selector::parse(s).expect("valid selector"))
    .collect()
});

/// Archive chrome and page furniture removed from the body.
const ARTIFACT_SELECTORS: &[&str] = &[
    r#"[id^="wm-"]"#,
    "script",
    "style",
    "noscript",
    "iframe",
    "nav",
    "aside",
    "footer",
];

/// Archive-relative or absolute capture URL: `/web/<ts><modifier>/<original>`.
static ARCHIVED_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:https?:)?(?://(?:web\.)?archive\.org)?/web/(\d{1,14})([a-z]{2}_)?/(.+)$")
        .expect("valid regex")
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Fetches captures and turns them into [`ExtractedContent`].
pub struct Extractor {
    wayback: Arc<WaybackClient>,
}

impl Extractor {
    #[must_use]
    pub fn new(wayback: Arc<WaybackClient>) -> Self {
        Self { wayback }
    }

    /// Fetch and extract one page.
    ///
    /// Images whose capture cannot be resolved are dropped from the body.
    ///
    /// # Errors
    ///
    /// Returns an [`ExtractionError`] if the page itself cannot be fetched or
    /// has no usable content.
    pub async fn extract(&self, page: &PageRecord) -> Result<ExtractedContent, ExtractionError> {
        let raw = self
            .wayback
            .fetch_capture(
                &page.capture_url,
                &page.snapshot_timestamp,
                CaptureKind::Rendered,
            )
            .await?;

        let html = decode_html(&raw)?;
        let parsed = parse_page(&html, &page.original_url)?;

        let mut images = Vec::new();
        let mut new_index = vec![None; parsed.images.len()];
        for (i, image) in parsed.images.iter().enumerate() {
            match self.fetch_image(image, &page.snapshot_timestamp).await {
                Ok(Some(extracted)) => {
                    new_index[i] = Some(images.len());
                    images.push(extracted);
                }
                Ok(None) => {
                    warn!(page = %page.original_url, image = %image.original_url, "No capture for image, dropping it");
                }
                Err(e) => {
                    warn!(page = %page.original_url, image = %image.original_url, error = %e, "Failed to fetch image, dropping it");
                }
            }
        }

        let body_html = rewrite_image_placeholders(&parsed.body_html, |i| {
            new_index.get(i).copied().flatten().map(image_placeholder)
        })
        .map_err(ExtractionError::Unparseable)?;

        debug!(
            url = %page.original_url,
            title = %parsed.title,
            images = images.len(),
            dropped = parsed.images.len() - images.len(),
            "Extracted page"
        );

        Ok(ExtractedContent {
            title: parsed.title,
            body_html,
            excerpt: parsed.excerpt,
            published_gmt: parsed.published_gmt,
            slug: parsed.slug,
            images,
        })
    }

    async fn fetch_image(
        &self,
        image: &ImageRef,
        page_timestamp: &str,
    ) -> Result<Option<ExtractedImage>, SnapshotError> {
        let Some(timestamp) = self
            .wayback
            .find_image_capture(&image.original_url, page_timestamp)
            .await?
        else {
            return Ok(None);
        };

        let data = self
            .wayback
            .fetch_capture(&image.original_url, &timestamp, CaptureKind::Image)
            .await?;

        Ok(Some(ExtractedImage {
            archived_url: self
                .wayback
                .capture_url(&image.original_url, &timestamp, CaptureKind::Image),
            original_url: image.original_url.clone(),
            data,
            alt_text: image.alt_text.clone(),
        }))
    }
}

/// Decode a rendered capture. Binary payloads are rejected.
fn decode_html(raw: &[u8]) -> Result<String, ExtractionError> {
    if raw.contains(&0) {
        return Err(ExtractionError::Unparseable(
            "capture is binary, not HTML".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(raw).into_owned())
}

/// Parse a rendered capture of `original_url`.
///
/// The returned body has archive chrome removed, links restored to their
/// original targets, and every image `src` replaced by a placeholder indexing
/// into `images`.
///
/// # Errors
///
/// Returns [`ExtractionError::EmptyContent`] if no text remains, or
/// [`ExtractionError::Unparseable`] if the markup cannot be rewritten.
pub fn parse_page(html: &str, original_url: &str) -> Result<ParsedPage, ExtractionError> {
    let (title, excerpt, published_gmt, container_html) = {
        let document = Html::parse_document(html);
        let title = HEADINGS
            .iter()
            .chain(std::iter::once(&*TITLE))
            .find_map(|sel| first_text(&document, sel))
            .unwrap_or_else(|| UNTITLED.to_string());
        let excerpt = document
            .select(&META_DESCRIPTION)
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(|c| truncate_chars(c.trim(), MAX_EXCERPT_CHARS))
            .filter(|c| !c.is_empty());
        let published_gmt = document
            .select(&TIME)
            .next()
            .and_then(|el| el.value().attr("datetime"))
            .and_then(to_gmt);
        let container_html = CONTENT_CONTAINERS
            .iter()
            .find_map(|sel| document.select(sel).next())
            .map(|el| el.inner_html())
            .unwrap_or_default();
        (title, excerpt, published_gmt, container_html)
    };

    // Artifacts go first so nothing inside them is collected below.
    let mut strip = Vec::new();
    for selector in ARTIFACT_SELECTORS {
        strip.push(element!(*selector, |el| {
            el.remove();
            Ok(())
        }));
    }
    let stripped = rewrite_html(&container_html, strip).map_err(ExtractionError::Unparseable)?;

    let base = Url::parse(original_url).ok();
    let images: RefCell<Vec<ImageRef>> = RefCell::new(Vec::new());

    let handlers = vec![
        element!("a[href]", |el| {
            if let Some(href) = el.get_attribute("href") {
                if let Some(restored) = restore_link(&href, base.as_ref()) {
                    el.set_attribute("href", &restored)?;
                }
            }
            Ok(())
        }),
        element!("img", |el| {
            el.remove_attribute("srcset");
            let src = el.get_attribute("src").unwrap_or_default();
            let src = src.trim();
            if src.starts_with("data:") {
                return Ok(());
            }
            let Some(resolved) = restore_link(src, base.as_ref()).filter(|u| is_http(u)) else {
                el.remove();
                return Ok(());
            };
            let mut images = images.borrow_mut();
            // Repeated images share one entry.
            let index = images
                .iter()
                .position(|image| image.original_url == resolved)
                .unwrap_or_else(|| {
                    images.push(ImageRef {
                        original_url: resolved,
                        alt_text: el.get_attribute("alt").unwrap_or_default().trim().to_string(),
                    });
                    images.len() - 1
                });
            el.set_attribute("src", &image_placeholder(index))?;
            Ok(())
        }),
    ];

    let body_html = rewrite_html(&stripped, handlers).map_err(ExtractionError::Unparseable)?;

    if !has_text(&body_html) {
        return Err(ExtractionError::EmptyContent);
    }

    Ok(ParsedPage {
        title,
        body_html: body_html.trim().to_string(),
        excerpt,
        published_gmt,
        slug: slug_from_url(original_url),
        images: images.into_inner(),
    })
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .find(|t| !t.is_empty())
}

fn has_text(fragment: &str) -> bool {
    Html::parse_fragment(fragment)
        .root_element()
        .text()
        .any(|t| !t.trim().is_empty())
}

fn collapse_whitespace(s: &str) -> String {
    WHITESPACE.replace_all(s.trim(), " ").into_owned()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Resolve a link found in a capture back to the URL it pointed at originally.
///
/// Archive URLs are unwrapped and relative links are resolved against the
/// page's original URL. Fragment-only and non-navigational links yield `None`.
#[must_use]
pub fn restore_link(href: &str, base: Option<&Url>) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("javascript:")
        || href.starts_with("data:")
    {
        return None;
    }

    if let Some(caps) = ARCHIVED_URL.captures(href) {
        let original = &caps[3];
        let original = if is_http(original) {
            original.to_string()
        } else if let Some(rest) = original
            .strip_prefix("http:/")
            .or_else(|| original.strip_prefix("https:/"))
        {
            // The archive sometimes collapses the double slash.
            format!("http://{rest}")
        } else {
            format!("http://{original}")
        };
        return Some(original);
    }

    if is_http(href) {
        return Some(href.to_string());
    }
    base.and_then(|b| b.join(href).ok()).map(|u| u.to_string())
}

/// Parse a `datetime` attribute into the CMS's GMT date format.
fn to_gmt(value: &str) -> Option<String> {
    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc).format(FORMAT).to_string());
    }
    for fmt in [FORMAT, "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.format(FORMAT).to_string());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.format(FORMAT).to_string())
}

/// Post slug from the last path segment (`index` for the site root).
#[must_use]
pub fn slug_from_url(url: &str) -> String {
    let segment = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segs| segs.rfind(|s| !s.is_empty()).map(ToString::to_string))
        })
        .unwrap_or_default();

    let stem = segment
        .rsplit_once('.')
        .filter(|(_, ext)| matches!(*ext, "html" | "htm" | "php" | "asp" | "aspx"))
        .map_or(segment.as_str(), |(stem, _)| stem);

    let mut slug = String::with_capacity(stem.len());
    for c in stem.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');

    if slug.is_empty() {
        "index".to_string()
    } else {
        slug.to_string()
    }
}
