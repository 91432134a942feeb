use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::constants::{DEFAULT_EXCLUDE_PATHS, DEFAULT_USER_AGENT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Importer configuration loaded from environment variables.
///
/// Built once at startup and handed to each component by reference; nothing
/// reads the environment after this point.
#[derive(Debug, Clone)]
pub struct Config {
    // WordPress
    pub wp_url: String,
    pub wp_username: String,
    pub wp_app_password: String,
    pub default_category_id: u64,

    // Database
    pub database_path: PathBuf,

    // Wayback Machine
    pub wayback_base_url: String,
    pub before_date: String,
    pub after_date: Option<String>,
    pub rate_limit_per_sec: u32,
    pub user_agent: String,
    pub discovery_limit: u32,
    pub exclude_paths: Vec<String>,

    // Workers
    pub worker_concurrency: usize,
    pub max_publish_attempts: u32,
    pub http_timeout: Duration,
    pub retry_base_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // WordPress
            wp_url: required_env("WP_URL")?,
            wp_username: required_env("WP_USERNAME")?,
            wp_app_password: required_env("WP_APP_PASSWORD")?,
            default_category_id: parse_env_u64("WP_DEFAULT_CATEGORY_ID", 1)?,

            // Database
            database_path: PathBuf::from(env_or_default(
                "DATABASE_PATH",
                "./data/wayback_import.sqlite",
            )),

            // Wayback Machine
            wayback_base_url: env_or_default("WAYBACK_BASE_URL", "https://web.archive.org"),
            before_date: env_or_default("WAYBACK_BEFORE_DATE", "20240801"),
            after_date: optional_env("WAYBACK_AFTER_DATE"),
            rate_limit_per_sec: parse_env_u32("WAYBACK_RATE_LIMIT", 3)?,
            user_agent: env_or_default("USER_AGENT", DEFAULT_USER_AGENT),
            discovery_limit: parse_env_u32("DISCOVERY_LIMIT", 1000)?,
            exclude_paths: optional_env("EXCLUDE_PATHS").map_or_else(
                || DEFAULT_EXCLUDE_PATHS.iter().map(ToString::to_string).collect(),
                |v| parse_list(&v),
            ),

            // Workers
            worker_concurrency: parse_env_usize("WORKER_CONCURRENCY", 4)?,
            max_publish_attempts: parse_env_u32("MAX_PUBLISH_ATTEMPTS", 5)?,
            http_timeout: Duration::from_secs(parse_env_u64("HTTP_TIMEOUT_SECS", 30)?),
            retry_base_delay: Duration::from_millis(parse_env_u64("RETRY_BASE_DELAY_MS", 500)?),
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "must be at least 1"));
        }
        if self.rate_limit_per_sec == 0 {
            return Err(invalid("WAYBACK_RATE_LIMIT", "must be at least 1"));
        }
        if self.max_publish_attempts == 0 {
            return Err(invalid("MAX_PUBLISH_ATTEMPTS", "must be at least 1"));
        }
        if !is_archive_date(&self.before_date) {
            return Err(invalid(
                "WAYBACK_BEFORE_DATE",
                &format!("expected YYYYMMDD, got '{}'", self.before_date),
            ));
        }
        if let Some(after) = &self.after_date {
            if !is_archive_date(after) {
                return Err(invalid(
                    "WAYBACK_AFTER_DATE",
                    &format!("expected YYYYMMDD, got '{after}'"),
                ));
            }
            if after.as_str() > self.before_date.as_str() {
                return Err(invalid(
                    "WAYBACK_AFTER_DATE",
                    "must not be later than WAYBACK_BEFORE_DATE",
                ));
            }
        }
        if url::Url::parse(&self.wp_url).is_err() {
            return Err(invalid("WP_URL", "must be an absolute URL"));
        }
        if url::Url::parse(&self.wayback_base_url).is_err() {
            return Err(invalid("WAYBACK_BASE_URL", "must be an absolute URL"));
        }
        Ok(())
    }

    /// Configuration suitable for tests: local endpoints, tiny retry delays.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            wp_url: "http://127.0.0.1:9".to_string(),
            wp_username: "admin".to_string(),
            wp_app_password: "test test test test".to_string(),
            default_category_id: 1,
            database_path: PathBuf::from("./test.sqlite"),
            wayback_base_url: "http://127.0.0.1:9".to_string(),
            before_date: "20240801".to_string(),
            after_date: None,
            rate_limit_per_sec: 1000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            discovery_limit: 1000,
            exclude_paths: DEFAULT_EXCLUDE_PATHS.iter().map(ToString::to_string).collect(),
            worker_concurrency: 2,
            max_publish_attempts: 3,
            http_timeout: Duration::from_secs(5),
            retry_base_delay: Duration::from_millis(1),
        }
    }
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.to_string(),
    }
}

/// `YYYYMMDD`, the date granularity the snapshot index accepts.
fn is_archive_date(value: &str) -> bool {
    value.len() == 8
        && value.bytes().all(|b| b.is_ascii_digit())
        && chrono::NaiveDate::parse_from_str(value, "%Y%m%d").is_ok()
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}
