use serde::{Deserialize, Serialize};

/// Lifecycle of an imported page.
///
/// Status only moves forward, except that a failed publish may be retried.
/// The allowed moves live in the `WHERE` clauses of the update queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Discovered,
    Fetched,
    PublishFailed,
    Published,
    Rewritten,
}

impl PageStatus {
    pub const ALL: [Self; 5] = [
        Self::Discovered,
        Self::Fetched,
        Self::PublishFailed,
        Self::Published,
        Self::Rewritten,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Fetched => "fetched",
            Self::PublishFailed => "publish_failed",
            Self::Published => "published",
            Self::Rewritten => "rewritten",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(Self::Discovered),
            "fetched" => Some(Self::Fetched),
            "publish_failed" => Some(Self::PublishFailed),
            "published" => Some(Self::Published),
            "rewritten" => Some(Self::Rewritten),
            _ => None,
        }
    }

    /// Whether the page has a draft in the CMS (and therefore a `new_url`).
    #[must_use]
    pub fn has_draft(&self) -> bool {
        matches!(self, Self::Published | Self::Rewritten)
    }
}

impl std::fmt::Display for PageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per logical page discovered in the archive.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PageRecord {
    /// Normalized original URL; the primary key.
    pub original_url: String,
    /// URL exactly as the snapshot index reported it.
    pub capture_url: String,
    pub snapshot_timestamp: String,
    pub status: String,
    pub new_url: Option<String>,
    pub cms_post_id: Option<i64>,
    pub error_detail: Option<String>,
    pub attempts: i64,
    pub discovered_at: String,
    pub last_attempt_at: Option<String>,
}

impl PageRecord {
    #[must_use]
    pub fn status_enum(&self) -> Option<PageStatus> {
        PageStatus::from_str(&self.status)
    }
}

/// A page as written by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPage {
    pub original_url: String,
    pub capture_url: String,
    pub snapshot_timestamp: String,
}

/// Old URL to new URL, derived from published rows.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MappingEntry {
    pub original_url: String,
    pub new_url: String,
}

/// Number of pages per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub discovered: i64,
    pub fetched: i64,
    pub publish_failed: i64,
    pub published: i64,
    pub rewritten: i64,
}

impl StatusCounts {
    #[must_use]
    pub fn get(&self, status: PageStatus) -> i64 {
        match status {
            PageStatus::Discovered => self.discovered,
            PageStatus::Fetched => self.fetched,
            PageStatus::PublishFailed => self.publish_failed,
            PageStatus::Published => self.published,
            PageStatus::Rewritten => self.rewritten,
        }
    }

    #[must_use]
    pub fn total(&self) -> i64 {
        PageStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}
