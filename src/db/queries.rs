use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{MappingEntry, NewPage, PageRecord, PageStatus, StatusCounts};

// Every status update below carries the set of statuses it may leave from in
// its WHERE clause. A `false` return means the row was missing or the move is
// not allowed from its current status; nothing was written in that case.

// ========== Discovery ==========

/// Insert a batch of discovered pages in one transaction.
///
/// Returns the number of rows actually written (existing URLs are skipped).
pub async fn insert_discovered_pages(pool: &SqlitePool, pages: &[NewPage]) -> Result<usize> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    let mut inserted = 0;

    for page in pages {
        let result = sqlx::query(
            r"
            INSERT INTO pages (original_url, capture_url, snapshot_timestamp, status)
            VALUES (?, ?, ?, 'discovered')
            ON CONFLICT(original_url) DO NOTHING
            ",
        )
        .bind(&page.original_url)
        .bind(&page.capture_url)
        .bind(&page.snapshot_timestamp)
        .execute(&mut *tx)
        .await
        .context("Failed to insert discovered page")?;

        if result.rows_affected() == 1 {
            inserted += 1;
        }
    }

    tx.commit()
        .await
        .context("Failed to commit discovered pages")?;
    Ok(inserted)
}

// ========== Lookups ==========

/// Get a page by its normalized original URL.
pub async fn get_page(pool: &SqlitePool, original_url: &str) -> Result<Option<PageRecord>> {
    sqlx::query_as("SELECT * FROM pages WHERE original_url = ?")
        .bind(original_url)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch page")
}

/// Pages the publish phase should (re)process.
///
/// Includes rows left at `fetched` by an interrupted run, and failed rows that
/// still have attempts left.
pub async fn get_publish_candidates(
    pool: &SqlitePool,
    max_attempts: u32,
) -> Result<Vec<PageRecord>> {
    sqlx::query_as(
        r"
        SELECT * FROM pages
        WHERE status IN ('discovered', 'fetched')
           OR (status = 'publish_failed' AND attempts < ?)
        ORDER BY original_url
        ",
    )
    .bind(i64::from(max_attempts))
    .fetch_all(pool)
    .await
    .context("Failed to fetch publish candidates")
}

/// Pages that have a draft in the CMS, for the rewrite pass.
pub async fn get_pages_with_drafts(pool: &SqlitePool) -> Result<Vec<PageRecord>> {
    sqlx::query_as(
        r"
        SELECT * FROM pages
        WHERE status IN ('published', 'rewritten') AND cms_post_id IS NOT NULL
        ORDER BY original_url
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to fetch pages with drafts")
}

/// The full old URL to new URL mapping.
///
/// Derived on every call from published and rewritten rows; there is no
/// separate mapping table.
pub async fn get_url_mapping(pool: &SqlitePool) -> Result<Vec<MappingEntry>> {
    sqlx::query_as(
        r"
        SELECT original_url, new_url FROM pages
        WHERE status IN ('published', 'rewritten') AND new_url IS NOT NULL
        ORDER BY original_url
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to fetch URL mapping")
}

/// Count pages per status.
pub async fn count_pages_by_status(pool: &SqlitePool) -> Result<StatusCounts> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM pages GROUP BY status")
            .fetch_all(pool)
            .await
            .context("Failed to count pages by status")?;

    let mut counts = StatusCounts::default();
    for (status, count) in rows {
        match PageStatus::from_str(&status) {
            Some(PageStatus::Discovered) => counts.discovered = count,
            Some(PageStatus::Fetched) => counts.fetched = count,
            Some(PageStatus::PublishFailed) => counts.publish_failed = count,
            Some(PageStatus::Published) => counts.published = count,
            Some(PageStatus::Rewritten) => counts.rewritten = count,
            None => {}
        }
    }
    Ok(counts)
}

// ========== Transitions ==========

/// Mark a page as successfully extracted.
pub async fn set_page_fetched(pool: &SqlitePool, original_url: &str) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE pages
        SET status = 'fetched',
            error_detail = NULL,
            last_attempt_at = datetime('now')
        WHERE original_url = ?
          AND status IN ('discovered', 'fetched', 'publish_failed')
        ",
    )
    .bind(original_url)
    .execute(pool)
    .await
    .context("Failed to set page fetched")?;

    Ok(result.rows_affected() == 1)
}

/// Record a failed extract or publish attempt.
pub async fn set_page_publish_failed(
    pool: &SqlitePool,
    original_url: &str,
    error: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE pages
        SET status = 'publish_failed',
            error_detail = ?,
            attempts = attempts + 1,
            last_attempt_at = datetime('now')
        WHERE original_url = ?
          AND status IN ('discovered', 'fetched', 'publish_failed')
        ",
    )
    .bind(error)
    .bind(original_url)
    .execute(pool)
    .await
    .context("Failed to set page publish failed")?;

    Ok(result.rows_affected() == 1)
}

/// Record the draft created for a page.
///
/// Only valid once the CMS has confirmed the draft.
pub async fn set_page_published(
    pool: &SqlitePool,
    original_url: &str,
    cms_post_id: i64,
    new_url: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE pages
        SET status = 'published',
            cms_post_id = ?,
            new_url = ?,
            error_detail = NULL,
            last_attempt_at = datetime('now')
        WHERE original_url = ? AND status = 'fetched'
        ",
    )
    .bind(cms_post_id)
    .bind(new_url)
    .bind(original_url)
    .execute(pool)
    .await
    .context("Failed to set page published")?;

    Ok(result.rows_affected() == 1)
}

/// Mark a published page whose links have been rewritten.
///
/// Also refreshes a page that was already rewritten in an earlier run.
pub async fn set_page_rewritten(pool: &SqlitePool, original_url: &str) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE pages
        SET status = 'rewritten',
            error_detail = NULL,
            last_attempt_at = datetime('now')
        WHERE original_url = ? AND status IN ('published', 'rewritten')
        ",
    )
    .bind(original_url)
    .execute(pool)
    .await
    .context("Failed to set page rewritten")?;

    Ok(result.rows_affected() == 1)
}

/// Record a failed rewrite. The page keeps its status.
pub async fn set_page_rewrite_error(
    pool: &SqlitePool,
    original_url: &str,
    error: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE pages
        SET error_detail = ?,
            last_attempt_at = datetime('now')
        WHERE original_url = ? AND status IN ('published', 'rewritten')
        ",
    )
    .bind(error)
    .bind(original_url)
    .execute(pool)
    .await
    .context("Failed to set page rewrite error")?;

    Ok(result.rows_affected() == 1)
}

/// Give every failed page a fresh set of attempts.
///
/// Returns the number of pages reset.
pub async fn reset_failed_attempts(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("UPDATE pages SET attempts = 0 WHERE status = 'publish_failed'")
        .execute(pool)
        .await
        .context("Failed to reset failed pages")?;

    Ok(result.rows_affected())
}
