//! Discovery: list a domain's captures and record one page per logical URL.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};
use url::Url;

use crate::db::{self, Database, NewPage};
use crate::normalize::{is_same_site, normalize_url};
use crate::wayback::{is_at_or_before, CdxRow, WaybackClient};

/// Counts from one discovery run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    /// Capture rows returned by the index.
    pub captures: usize,
    /// Distinct pages after filtering and deduplication.
    pub unique: usize,
    /// Pages not already in the state store.
    pub inserted: usize,
}

/// Finds pages to import and records them as `discovered`.
pub struct Discoverer {
    db: Database,
    wayback: Arc<WaybackClient>,
    before_date: String,
    exclude_paths: Vec<String>,
}

impl Discoverer {
    #[must_use]
    pub fn new(
        db: Database,
        wayback: Arc<WaybackClient>,
        before_date: String,
        exclude_paths: Vec<String>,
    ) -> Self {
        Self {
            db,
            wayback,
            before_date,
            exclude_paths,
        }
    }

    /// Discover pages under `domain`.
    ///
    /// Nothing is written unless the index query succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot index is unavailable or the state
    /// store fails.
    pub async fn run(&self, domain: &str) -> Result<DiscoverySummary> {
        info!(domain = %domain, before = %self.before_date, "Discovering archived pages");

        let rows = self
            .wayback
            .find_captures(domain, &self.before_date)
            .await
            .with_context(|| format!("Discovery failed for {domain}"))?;

        let pages = select_pages(&rows, domain, &self.before_date, &self.exclude_paths);
        let inserted = db::insert_discovered_pages(self.db.pool(), &pages).await?;

        let summary = DiscoverySummary {
            captures: rows.len(),
            unique: pages.len(),
            inserted,
        };
        info!(
            domain = %domain,
            captures = summary.captures,
            unique = summary.unique,
            inserted = summary.inserted,
            "Discovery complete"
        );
        Ok(summary)
    }
}

/// Reduce index rows to one page per normalized URL.
///
/// Keeps the latest capture at or before `before_date`; equal timestamps are
/// broken by the larger capture URL so the choice never depends on row order.
#[must_use]
pub fn select_pages(
    rows: &[CdxRow],
    domain: &str,
    before_date: &str,
    exclude_paths: &[String],
) -> Vec<NewPage> {
    let mut best: BTreeMap<String, &CdxRow> = BTreeMap::new();

    for row in rows {
        if !is_at_or_before(&row.timestamp, before_date) {
            continue;
        }
        let Ok(parsed) = Url::parse(&row.original) else {
            debug!(url = %row.original, "Skipping unparseable capture URL");
            continue;
        };
        if !matches!(parsed.scheme(), "http" | "https") || !is_same_site(&row.original, domain) {
            continue;
        }
        if is_excluded(&parsed, exclude_paths) {
            debug!(url = %row.original, "Skipping excluded path");
            continue;
        }

        let key = normalize_url(&row.original);
        best.entry(key)
            .and_modify(|current| {
                if (row.timestamp.as_str(), row.original.as_str())
                    > (current.timestamp.as_str(), current.original.as_str())
                {
                    *current = row;
                }
            })
            .or_insert(row);
    }

    best.into_iter()
        .map(|(original_url, row)| NewPage {
            original_url,
            capture_url: row.original.clone(),
            snapshot_timestamp: row.timestamp.clone(),
        })
        .collect()
}

fn is_excluded(url: &Url, exclude_paths: &[String]) -> bool {
    let path = url.path().to_lowercase();
    exclude_paths
        .iter()
        .any(|fragment| path.contains(&fragment.to_lowercase()))
}
