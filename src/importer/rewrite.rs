//! Second pass: point internal links in published drafts at their new URLs.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use lol_html::element;
use tracing::{debug, info, warn};

use super::html::rewrite_html;
use super::is_fatal;
use crate::cms::WordPressClient;
use crate::db::{self, Database, MappingEntry, PageRecord};
use crate::normalize::normalize_url;

/// Counts from one rewrite pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    /// Drafts inspected.
    pub scanned: usize,
    /// Drafts updated with at least one rewritten link.
    pub rewritten: usize,
    /// Drafts with no link to another imported page.
    pub unchanged: usize,
    pub failed: usize,
    /// Total links replaced across all drafts.
    pub links: usize,
}

/// Normalized old URL to new URL.
pub type UrlMap = HashMap<String, String>;

/// Build the lookup map from the persisted mapping.
#[must_use]
pub fn build_url_map(entries: Vec<MappingEntry>) -> UrlMap {
    entries
        .into_iter()
        .map(|e| (normalize_url(&e.original_url), e.new_url))
        .collect()
}

/// Replace every `href` whose normalized form is a key of `map`.
///
/// Only whole-URL matches are replaced. Returns the new markup and the number
/// of links replaced.
///
/// # Errors
///
/// Returns an error if the markup cannot be rewritten.
pub fn rewrite_hrefs(html: &str, map: &UrlMap) -> Result<(String, usize)> {
    let count = Cell::new(0usize);

    let output = rewrite_html(
        html,
        vec![element!("a[href]", |el| {
            if let Some(href) = el.get_attribute("href") {
                if let Some(new_url) = map.get(&normalize_url(&href)) {
                    el.set_attribute("href", new_url)?;
                    count.set(count.get() + 1);
                }
            }
            Ok(())
        })],
    )
    .map_err(|e| anyhow!(e))?;

    Ok((output, count.get()))
}

/// Rewrites links in drafts once every page has been through the publish phase.
pub struct LinkRewriter {
    db: Database,
    cms: Arc<WordPressClient>,
}

impl LinkRewriter {
    #[must_use]
    pub fn new(db: Database, cms: Arc<WordPressClient>) -> Self {
        Self { db, cms }
    }

    /// Rewrite links in every draft.
    ///
    /// The mapping is read fresh from the state store. Per-draft failures are
    /// recorded on the page and do not stop the pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the CMS refused our credentials or the state store
    /// failed.
    pub async fn run(&self) -> Result<RewriteSummary> {
        let map = build_url_map(db::get_url_mapping(self.db.pool()).await?);
        let pages = db::get_pages_with_drafts(self.db.pool()).await?;
        info!(drafts = pages.len(), mappings = map.len(), "Starting link rewrite pass");

        let mut summary = RewriteSummary::default();
        for page in &pages {
            summary.scanned += 1;
            match self.rewrite_page(page, &map).await {
                Ok(0) => summary.unchanged += 1,
                Ok(links) => {
                    summary.rewritten += 1;
                    summary.links += links;
                }
                Err(e) if is_fatal(&e) => {
                    return Err(e.context(format!("rewriting {}", page.original_url)));
                }
                Err(e) => {
                    let detail = format!("rewrite failed: {e:#}");
                    warn!(url = %page.original_url, error = %detail, "Failed to rewrite links");
                    db::set_page_rewrite_error(self.db.pool(), &page.original_url, &detail)
                        .await?;
                    summary.failed += 1;
                }
            }
        }

        info!(
            scanned = summary.scanned,
            rewritten = summary.rewritten,
            unchanged = summary.unchanged,
            failed = summary.failed,
            links = summary.links,
            "Link rewrite pass complete"
        );
        Ok(summary)
    }

    async fn rewrite_page(&self, page: &PageRecord, map: &UrlMap) -> Result<usize> {
        let post_id = page
            .cms_post_id
            .ok_or_else(|| anyhow!("page has no draft id"))?;

        let content = self.cms.get_post_content(post_id).await?;
        let (updated, links) = rewrite_hrefs(&content, map)?;
        if links == 0 {
            debug!(url = %page.original_url, "No internal links to rewrite");
            return Ok(0);
        }

        self.cms.update_post_content(post_id, &updated).await?;
        db::set_page_rewritten(self.db.pool(), &page.original_url).await?;
        debug!(url = %page.original_url, links, "Rewrote internal links");
        Ok(links)
    }
}
