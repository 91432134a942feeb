//! The import pipeline: discovery, extraction, publishing and link rewriting.

pub mod discover;
pub mod extract;
mod html;
pub mod publish;
mod rate_limiter;
pub mod rewrite;
mod worker;

pub use discover::{Discoverer, DiscoverySummary};
pub use extract::{ExtractedContent, ExtractedImage, ExtractionError, Extractor};
pub use publish::{PageOutcome, Publisher};
pub use rate_limiter::RateLimiter;
pub use rewrite::{LinkRewriter, RewriteSummary};
pub use worker::{Pipeline, PublishSummary, RunSummary};

use crate::cms::CmsError;

/// Whether an error means the run cannot continue.
fn is_fatal(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<CmsError>()
        .is_some_and(CmsError::is_fatal)
}
