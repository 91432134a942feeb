//! URL canonicalization.
//!
//! Discovery keys pages on the normalized URL, and the link rewriter looks
//! hrefs up by the same key, so both sides must go through [`normalize_url`].

use url::Url;

/// Tracking parameters to strip from URLs.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "gclsrc",
    "dclid",
    "igshid",
];

/// Normalize a URL so equivalent spellings collapse to one key.
///
/// - scheme forced to `https`
/// - host lower-cased, default port dropped
/// - tracking parameters and fragment removed
/// - trailing slash removed from non-root paths
///
/// Non-HTTP or unparseable input is returned unchanged.
#[must_use]
pub fn normalize_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return url.to_string();
    };

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return url.to_string();
    }

    let mut normalized = parsed;

    // `Url` lower-cases the host and drops the scheme's own default port on parse.
    if normalized.scheme() == "http" {
        let _ = normalized.set_scheme("https");
    }
    if normalized.port() == Some(443) || normalized.port() == Some(80) {
        let _ = normalized.set_port(None);
    }

    let filtered_params: Vec<(String, String)> = normalized
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    if filtered_params.is_empty() {
        normalized.set_query(None);
    } else {
        let new_query: String = filtered_params
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        normalized.set_query(Some(&new_query));
    }

    normalized.set_fragment(None);

    let path = normalized.path().to_string();
    if path.ends_with('/') && path.len() > 1 {
        normalized.set_path(path.trim_end_matches('/'));
    }

    normalized.to_string()
}

/// Lower-cased host of a URL, if it has one.
#[must_use]
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
}

/// Whether a URL's host is `domain` or one of its subdomains.
#[must_use]
pub fn is_same_site(url: &str, domain: &str) -> bool {
    let domain = domain.trim().trim_end_matches('/').to_lowercase();
    host_of(url).is_some_and(|host| host == domain || host.ends_with(&format!(".{domain}")))
}

fn is_tracking_param(key: &str) -> bool {
    let lower = key.to_lowercase();
    TRACKING_PARAMS.contains(&lower.as_str()) || lower.starts_with("utm_")
}
