use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::discover::{Discoverer, DiscoverySummary};
use super::extract::Extractor;
use super::publish::{PageOutcome, Publisher};
use super::rate_limiter::RateLimiter;
use super::rewrite::{LinkRewriter, RewriteSummary};
use crate::cms::WordPressClient;
use crate::config::Config;
use crate::db::{self, Database, PageRecord, StatusCounts};
use crate::wayback::WaybackClient;

/// Counts from one publish phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub candidates: usize,
    pub published: usize,
    pub failed: usize,
    /// Pages never started because the run was interrupted or hit a fatal error.
    pub skipped: usize,
}

/// Everything one full run did.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub discovery: DiscoverySummary,
    pub publish: PublishSummary,
    /// `None` when the run was interrupted before the rewrite pass.
    pub rewrite: Option<RewriteSummary>,
    pub counts: StatusCounts,
}

/// Drives discovery, the publish phase, and the rewrite pass.
///
/// Cloning is cheap; clones share clients, the rate limiter and the
/// cancellation token.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    db: Database,
    discoverer: Arc<Discoverer>,
    extractor: Arc<Extractor>,
    publisher: Arc<Publisher>,
    rewriter: Arc<LinkRewriter>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Build the pipeline and its clients. One rate limiter is shared by
    /// every outbound request.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn new(config: Config, db: Database) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_per_sec));
        let wayback = Arc::new(WaybackClient::new(&config, Arc::clone(&limiter))?);
        let cms = Arc::new(WordPressClient::new(&config, limiter)?);

        Ok(Self {
            discoverer: Arc::new(Discoverer::new(
                db.clone(),
                Arc::clone(&wayback),
                config.before_date.clone(),
                config.exclude_paths.clone(),
            )),
            extractor: Arc::new(Extractor::new(wayback)),
            publisher: Arc::new(Publisher::new(
                db.clone(),
                Arc::clone(&cms),
                config.default_category_id,
            )),
            rewriter: Arc::new(LinkRewriter::new(db.clone(), cms)),
            config: Arc::new(config),
            db,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that interrupts the run between pages when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record the pages archived under `domain`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot index is unavailable.
    pub async fn discover(&self, domain: &str) -> Result<DiscoverySummary> {
        self.discoverer.run(domain).await
    }

    /// Extract and publish every eligible page with a bounded worker pool.
    ///
    /// Returns once every started page has committed its status.
    ///
    /// # Errors
    ///
    /// Returns an error if the CMS refused our credentials or the state store
    /// failed. In-flight pages still finish first.
    pub async fn publish_pending(&self) -> Result<PublishSummary> {
        let candidates =
            db::get_publish_candidates(self.db.pool(), self.config.max_publish_attempts).await?;
        let mut summary = PublishSummary {
            candidates: candidates.len(),
            ..PublishSummary::default()
        };
        if candidates.is_empty() {
            info!("No pages to publish");
            return Ok(summary);
        }
        info!(
            pages = candidates.len(),
            workers = self.config.worker_concurrency,
            "Starting publish phase"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.worker_concurrency));
        let stop = self.cancel.child_token();
        let mut handles = Vec::new();

        for page in candidates {
            let permit = tokio::select! {
                () = stop.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => permit?,
            };
            if stop.is_cancelled() {
                break;
            }

            let extractor = Arc::clone(&self.extractor);
            let publisher = Arc::clone(&self.publisher);
            let db = self.db.clone();
            let stop = stop.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = process_page(&db, &extractor, &publisher, &page).await;
                if result.is_err() {
                    stop.cancel();
                }
                result
            });
            handles.push(handle);
        }

        let started = handles.len();
        summary.skipped = summary.candidates - started;

        // Barrier: every started page settles before anything else runs.
        let mut fatal = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(PageOutcome::Published { .. })) => summary.published += 1,
                Ok(Ok(PageOutcome::Failed { .. })) => summary.failed += 1,
                Ok(Err(e)) => {
                    error!("Stopping run: {e:#}");
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    error!("Worker task panicked: {e}");
                    summary.failed += 1;
                }
            }
        }

        info!(
            published = summary.published,
            failed = summary.failed,
            skipped = summary.skipped,
            "Publish phase complete"
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Rewrite internal links in every draft using the current mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the CMS refused our credentials or the state store
    /// failed.
    pub async fn rewrite_links(&self) -> Result<RewriteSummary> {
        self.rewriter.run().await
    }

    /// Full run: discover, publish, then rewrite.
    ///
    /// The rewrite pass only starts once the publish phase has drained, and is
    /// skipped if the run was interrupted.
    ///
    /// # Errors
    ///
    /// Returns an error for any failure that stops the run.
    pub async fn run(&self, domain: &str) -> Result<RunSummary> {
        let mut summary = RunSummary {
            discovery: self.discover(domain).await?,
            ..RunSummary::default()
        };

        if !self.cancel.is_cancelled() {
            summary.publish = self.publish_pending().await?;
        }

        if self.cancel.is_cancelled() {
            warn!("Run interrupted; rewrite pass skipped");
        } else {
            summary.rewrite = Some(self.rewrite_links().await?);
        }

        summary.counts = self.status_counts().await?;
        Ok(summary)
    }

    /// Give pages that ran out of publish attempts another round.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store fails.
    pub async fn retry_failed(&self) -> Result<u64> {
        let reset = db::reset_failed_attempts(self.db.pool()).await?;
        info!(pages = reset, "Reset failed pages for retry");
        Ok(reset)
    }

    /// Pages per status.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store fails.
    pub async fn status_counts(&self) -> Result<StatusCounts> {
        db::count_pages_by_status(self.db.pool()).await
    }
}

/// Extract then publish one page, committing each stage's status.
async fn process_page(
    db: &Database,
    extractor: &Extractor,
    publisher: &Publisher,
    page: &PageRecord,
) -> Result<PageOutcome> {
    debug!(url = %page.original_url, status = %page.status, "Processing page");

    let content = match extractor.extract(page).await {
        Ok(content) => content,
        Err(e) => {
            let detail = e.to_string();
            warn!(url = %page.original_url, error = %detail, "Failed to extract page");
            db::set_page_publish_failed(db.pool(), &page.original_url, &detail)
                .await
                .context("Failed to record extraction failure")?;
            return Ok(PageOutcome::Failed { detail });
        }
    };

    db::set_page_fetched(db.pool(), &page.original_url)
        .await
        .context("Failed to record fetched page")?;

    publisher.publish(page, content).await
}
