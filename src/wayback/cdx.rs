//! Snapshot index (CDX) query building and response parsing.

use serde_json::Value;

/// Fields requested from the index, in the order rows are returned.
pub const CDX_FIELDS: &[&str] = &[
    "urlkey",
    "timestamp",
    "original",
    "statuscode",
    "digest",
    "length",
];

/// One capture row from the snapshot index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdxRow {
    pub urlkey: String,
    pub timestamp: String,
    pub original: String,
    pub statuscode: String,
    pub digest: String,
    pub length: String,
}

/// Builder for snapshot index query parameters.
#[derive(Debug, Clone, Default)]
pub struct CdxQuery {
    params: Vec<(String, String)>,
}

impl CdxQuery {
    /// Start a query for `url` (may end in `/*` for a prefix match).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            params: vec![
                ("url".to_string(), url.into()),
                ("output".to_string(), "json".to_string()),
                ("fl".to_string(), CDX_FIELDS.join(",")),
            ],
        }
    }

    #[must_use]
    pub fn match_type(self, match_type: &str) -> Self {
        self.param("matchType", match_type)
    }

    /// Add a `filter`; may be repeated.
    #[must_use]
    pub fn filter(self, filter: &str) -> Self {
        self.param("filter", filter)
    }

    #[must_use]
    pub fn from_date(self, date: &str) -> Self {
        self.param("from", date)
    }

    #[must_use]
    pub fn to_date(self, date: &str) -> Self {
        self.param("to", date)
    }

    #[must_use]
    pub fn limit(self, limit: u32) -> Self {
        if limit == 0 {
            self
        } else {
            self.param("limit", &limit.to_string())
        }
    }

    fn param(mut self, key: &str, value: &str) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}

/// Parse an index response.
///
/// Accepts the JSON form (an array whose first row is a header) and the plain
/// form (one space-separated row per line, fields in [`CDX_FIELDS`] order).
/// An empty body means no captures.
///
/// # Errors
///
/// Returns a description of the problem if the body is malformed.
pub fn parse_cdx_response(body: &str) -> Result<Vec<CdxRow>, String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        parse_json(trimmed)
    } else {
        parse_plain(trimmed)
    }
}

fn parse_json(body: &str) -> Result<Vec<CdxRow>, String> {
    let value: Value = serde_json::from_str(body).map_err(|e| format!("invalid JSON: {e}"))?;
    let Value::Array(rows) = value else {
        return Err("expected a JSON array".to_string());
    };

    let mut rows = rows.into_iter();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let header = string_row(header).ok_or("header row is not an array of strings")?;

    let column = |name: &str| header.iter().position(|h| h == name);
    let idx_timestamp = column("timestamp").ok_or("missing 'timestamp' column")?;
    let idx_original = column("original").ok_or("missing 'original' column")?;
    let idx_urlkey = column("urlkey");
    let idx_statuscode = column("statuscode");
    let idx_digest = column("digest");
    let idx_length = column("length");

    rows.enumerate()
        .map(|(i, row)| {
            let row = string_row(row).ok_or_else(|| format!("row {} is not an array", i + 1))?;
            if row.len() != header.len() {
                return Err(format!(
                    "row {} has {} fields, header has {}",
                    i + 1,
                    row.len(),
                    header.len()
                ));
            }
            let get = |idx: Option<usize>| idx.map(|i| row[i].clone()).unwrap_or_default();
            Ok(CdxRow {
                urlkey: get(idx_urlkey),
                timestamp: row[idx_timestamp].clone(),
                original: row[idx_original].clone(),
                statuscode: get(idx_statuscode),
                digest: get(idx_digest),
                length: get(idx_length),
            })
        })
        .collect()
}

fn string_row(value: Value) -> Option<Vec<String>> {
    match value {
        Value::Array(cells) => cells
            .into_iter()
            .map(|c| match c {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                Value::Null => Some(String::new()),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

fn parse_plain(body: &str) -> Result<Vec<CdxRow>, String> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(i, line)| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let &[urlkey, timestamp, original, statuscode, digest, length] = fields.as_slice() else {
                return Err(format!(
                    "line {} has {} fields, expected {}",
                    i + 1,
                    fields.len(),
                    CDX_FIELDS.len()
                ));
            };
            Ok(CdxRow {
                urlkey: urlkey.to_string(),
                timestamp: timestamp.to_string(),
                original: original.to_string(),
                statuscode: statuscode.to_string(),
                digest: digest.to_string(),
                length: length.to_string(),
            })
        })
        .collect()
}

/// Whether a capture timestamp falls at or before `cutoff`.
///
/// `cutoff` may be a date (`YYYYMMDD`, inclusive of the whole day) or a full
/// 14-digit capture timestamp.
#[must_use]
pub fn is_at_or_before(timestamp: &str, cutoff: &str) -> bool {
    let len = cutoff.len().min(timestamp.len());
    timestamp.is_char_boundary(len) && &timestamp[..len] <= cutoff
}
