//! Draft publishing: upload images, create the post, record the new URL.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{info, warn};
use url::Url;

use super::extract::{ExtractedContent, ExtractedImage};
use super::html::rewrite_image_placeholders;
use super::is_fatal;
use crate::cms::{NewDraft, UploadedMedia, WordPressClient};
use crate::db::{self, Database, PageRecord};

/// What happened to one page in the publish phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Published { new_url: String },
    Failed { detail: String },
}

/// Creates drafts for extracted pages.
pub struct Publisher {
    db: Database,
    cms: Arc<WordPressClient>,
    category_id: u64,
}

impl Publisher {
    #[must_use]
    pub fn new(db: Database, cms: Arc<WordPressClient>, category_id: u64) -> Self {
        Self {
            db,
            cms,
            category_id,
        }
    }

    /// Publish one fetched page as a draft and record the outcome.
    ///
    /// CMS failures are recorded on the page and reported as
    /// [`PageOutcome::Failed`].
    ///
    /// # Errors
    ///
    /// Returns an error only when the run cannot continue: the CMS refused our
    /// credentials, or the state store failed.
    pub async fn publish(&self, page: &PageRecord, content: ExtractedContent) -> Result<PageOutcome> {
        match self.create_post(content).await {
            Ok((post_id, link)) => {
                let updated =
                    db::set_page_published(self.db.pool(), &page.original_url, post_id, &link)
                        .await?;
                if !updated {
                    warn!(url = %page.original_url, post_id, "Page left 'fetched' before its draft was recorded");
                }
                info!(url = %page.original_url, new_url = %link, "Published page");
                Ok(PageOutcome::Published { new_url: link })
            }
            Err(e) if is_fatal(&e) => Err(e.context(format!("publishing {}", page.original_url))),
            Err(e) => {
                let detail = format!("{e:#}");
                warn!(url = %page.original_url, error = %detail, "Failed to publish page");
                db::set_page_publish_failed(self.db.pool(), &page.original_url, &detail).await?;
                Ok(PageOutcome::Failed { detail })
            }
        }
    }

    async fn create_post(&self, content: ExtractedContent) -> Result<(i64, String)> {
        let mut uploaded: Vec<UploadedMedia> = Vec::with_capacity(content.images.len());
        for (index, image) in content.images.iter().enumerate() {
            uploaded.push(self.upload_image(index, image).await?);
        }

        let body = rewrite_image_placeholders(&content.body_html, |i| {
            uploaded.get(i).map(|m| m.source_url.clone())
        })
        .map_err(|e| anyhow!(e))?;

        let draft = NewDraft {
            title: content.title,
            content: body,
            excerpt: content.excerpt,
            slug: content.slug,
            date_gmt: content.published_gmt,
            featured_media: uploaded.first().map(|m| m.id),
            categories: vec![self.category_id],
        };

        let post = self.cms.create_draft(&draft).await?;
        Ok((post.id, post.link))
    }

    async fn upload_image(&self, index: usize, image: &ExtractedImage) -> Result<UploadedMedia> {
        let filename = media_filename(&image.original_url, index, &image.data);
        let content_type = mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .to_string();

        let media = self
            .cms
            .upload_media(&image.data, &filename, &content_type, &image.alt_text)
            .await?;
        Ok(media)
    }
}

/// Upload filename for an image: its last path segment, made safe.
///
/// Falls back to `image-<index>` and adds an extension sniffed from the bytes
/// when the URL has none.
#[must_use]
pub fn media_filename(image_url: &str, index: usize, data: &[u8]) -> String {
    let segment = Url::parse(image_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segs| segs.rfind(|s| !s.is_empty()).map(ToString::to_string))
        })
        .unwrap_or_default();

    let mut name = sanitize_filename(&segment);
    if name.is_empty() || name.starts_with('.') {
        name = format!("image-{index}{name}");
    }
    if mime_guess::from_path(&name).first().is_none() {
        if let Some(ext) = sniff_image_extension(data) {
            name = format!("{name}.{ext}");
        }
    }
    name
}

/// Replace characters that are awkward in filenames and URLs with `_`.
fn sanitize_filename(filename: &str) -> String {
    const MAX_NAME_LENGTH: usize = 120;

    let (name, ext) = filename
        .rfind('.')
        .map_or((filename, ""), |dot| filename.split_at(dot));

    let name: String = name
        .chars()
        .map(|c| match c {
            '(' | ')' | '-' | '_' | '.' => c,
            c if c.is_alphanumeric() => c,
            _ => '_',
        })
        .collect();
    let name = name
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    let name: String = name.chars().take(MAX_NAME_LENGTH).collect();

    let ext: String = ext
        .chars()
        .filter(|c| *c == '.' || c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();

    format!("{name}{ext}")
}

fn sniff_image_extension(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"\x89PNG") {
        Some("png")
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpg")
    } else if data.starts_with(b"GIF8") {
        Some("gif")
    } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        Some("webp")
    } else {
        None
    }
}
