//! Wayback importer library.
//!
//! Imports the archived pages of a website from the Wayback Machine into
//! WordPress as drafts, then repoints links between imported pages at their
//! new URLs.

// Allow raw string hashes for safety - they're harmless and prevent issues if content changes
#![allow(clippy::needless_raw_string_hashes)]

pub mod cms;
pub mod config;
pub mod constants;
pub mod db;
pub mod importer;
pub mod normalize;
pub mod retry;
pub mod wayback;
