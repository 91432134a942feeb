//! Shared constants used across the application.

/// User agent sent to the archive and the CMS unless `USER_AGENT` overrides it.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; WaybackImporter/1.1)";

/// Path fragments that never make useful articles (admin pages, feeds, taxonomies).
pub const DEFAULT_EXCLUDE_PATHS: &[&str] = &[
    "/wp-admin/",
    "/feed/",
    "/tag/",
    "/author/",
    ".xml",
    ".json",
];

/// Scheme used for image placeholders inside extracted bodies.
///
/// `wayback-import:image/3` refers to the fourth entry of the extracted image list.
pub const IMAGE_PLACEHOLDER_PREFIX: &str = "wayback-import:image/";

/// Attempts per HTTP call before a retryable failure is surfaced.
pub const HTTP_MAX_ATTEMPTS: u32 = 3;

/// Maximum length of the excerpt taken from the page's meta description.
pub const MAX_EXCERPT_CHARS: usize = 300;

/// Title used when a page has neither a heading nor a `<title>`.
pub const UNTITLED: &str = "Untitled";
