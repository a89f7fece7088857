//! Multi-source ASIN resolution for books described by loose metadata.
//!
//! Given a title/author pair (or an ISBN), the [`Resolver`] consults a
//! persistent cache, then iterates upstream sources in priority order through
//! a per-domain rate limiter, widening the search with generated query
//! variations when the exact input does not resolve. Results carry a full
//! diagnostic trail of every source and variation attempted.

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;

pub mod cache;
pub mod lookup;
pub mod normalize;
pub mod rate_limit;
pub mod sources;
pub mod variations;

pub use cache::{AsinCache, CacheError, CacheHit, CacheStats};
pub use lookup::{Resolver, ResolverConfig};
pub use rate_limit::{DomainProfile, RateBudgetRegistry};
pub use sources::{AdapterOutcome, SourceAdapter};
pub use variations::TitleIndex;

/// A candidate identifier failed format validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid identifier: {0:?}")]
pub struct InvalidAsin(pub String);

/// A validated retailer catalog identifier: `B` followed by 9 alphanumeric
/// characters, stored uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Asin(String);

impl Asin {
    /// Parse and validate a candidate identifier, uppercasing it.
    pub fn parse(raw: &str) -> Result<Self, InvalidAsin> {
        let candidate = raw.trim().to_ascii_uppercase();
        let mut chars = candidate.chars();
        let valid = candidate.len() == 10
            && chars.next() == Some('B')
            && chars.all(|c| c.is_ascii_alphanumeric());
        if valid {
            Ok(Self(candidate))
        } else {
            Err(InvalidAsin(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors constructing a [`LookupQuery`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("a query needs a title or an ISBN")]
    MissingTitle,
    #[error("not a valid ISBN-10/13: {0:?}")]
    InvalidIsbn(String),
}

/// A normalized 10- or 13-digit standard book number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Isbn(String);

impl Isbn {
    /// Parse an ISBN, stripping hyphens/spaces. Accepts a trailing `X`/`x`
    /// check character on 10-digit forms. Checksum is not verified: upstream
    /// metadata routinely carries miskeyed ISBNs that still resolve.
    pub fn parse(raw: &str) -> Result<Self, QueryError> {
        let cleaned: String = raw
            .chars()
            .filter(|c| !matches!(c, '-' | ' '))
            .map(|c| c.to_ascii_uppercase())
            .collect();
        let valid = match cleaned.len() {
            _ if !cleaned.is_ascii() => false,
            10 => {
                cleaned[..9].chars().all(|c| c.is_ascii_digit())
                    && matches!(cleaned.as_bytes()[9], b'0'..=b'9' | b'X')
            }
            13 => cleaned.chars().all(|c| c.is_ascii_digit()),
            _ => false,
        };
        if valid {
            Ok(Self(cleaned))
        } else {
            Err(QueryError::InvalidIsbn(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The ISBN-10 form, converting from a 978-prefixed ISBN-13 when needed.
    /// 979-prefixed ISBN-13s have no ISBN-10 equivalent.
    pub fn to_isbn10(&self) -> Option<String> {
        if self.0.len() == 10 {
            return Some(self.0.clone());
        }
        let body = self.0.strip_prefix("978")?;
        let digits = &body[..9];
        let sum: u32 = digits
            .bytes()
            .enumerate()
            .map(|(i, b)| (10 - i as u32) * u32::from(b - b'0'))
            .sum();
        let check = (11 - sum % 11) % 11;
        let check_char = if check == 10 {
            'X'
        } else {
            char::from_digit(check, 10)?
        };
        Some(format!("{digits}{check_char}"))
    }
}

impl fmt::Display for Isbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input descriptor for a lookup. Immutable once constructed; a title is
/// required unless an ISBN is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupQuery {
    title: Option<String>,
    author: Option<String>,
    isbn: Option<Isbn>,
}

impl LookupQuery {
    pub fn new(
        title: Option<String>,
        author: Option<String>,
        isbn: Option<Isbn>,
    ) -> Result<Self, QueryError> {
        let title = title.filter(|t| !t.trim().is_empty());
        let author = author.filter(|a| !a.trim().is_empty());
        if title.is_none() && isbn.is_none() {
            return Err(QueryError::MissingTitle);
        }
        Ok(Self {
            title,
            author,
            isbn,
        })
    }

    pub fn from_title(title: impl Into<String>, author: Option<String>) -> Result<Self, QueryError> {
        Self::new(Some(title.into()), author, None)
    }

    pub fn from_isbn(isbn: Isbn) -> Self {
        Self {
            title: None,
            author: None,
            isbn: Some(isbn),
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn isbn(&self) -> Option<&Isbn> {
        self.isbn.as_ref()
    }

    /// Normalized, order-stable cache fingerprint: `isbn|title|author`,
    /// lowercased with incidental whitespace collapsed.
    pub fn fingerprint(&self) -> String {
        normalize::fingerprint(
            self.isbn.as_ref().map(Isbn::as_str),
            self.title.as_deref(),
            self.author.as_deref(),
        )
    }

    /// Replace the title, keeping author and ISBN. Used by the variation
    /// generator; bypasses `new` because the replacement is never empty.
    pub(crate) fn with_title(&self, title: String) -> Self {
        Self {
            title: Some(title),
            author: self.author.clone(),
            isbn: self.isbn.clone(),
        }
    }

    pub(crate) fn with_author(&self, author: Option<String>) -> Self {
        Self {
            title: self.title.clone(),
            author,
            isbn: self.isbn.clone(),
        }
    }

    /// Short human-readable form for logs and the diagnostic trail.
    pub fn describe(&self) -> String {
        match (&self.title, &self.author, &self.isbn) {
            (Some(t), Some(a), _) => format!("{t} / {a}"),
            (Some(t), None, _) => t.clone(),
            (None, _, Some(i)) => format!("isbn:{i}"),
            (None, _, None) => String::from("<empty>"),
        }
    }
}

/// Error type for a single source attempt.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("throttled by upstream")]
    Throttled { retry_after: Option<Duration> },
    #[error("no identifier extractable: {0}")]
    Parse(String),
    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidAsin),
}

impl SourceError {
    /// Transient failures are retried once per adapter; the rest move the
    /// orchestrator to the next strategy immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout(Duration::ZERO)
        } else {
            SourceError::Network(e.to_string())
        }
    }
}

/// Failure classification recorded in the diagnostic trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Network,
    Timeout,
    Throttled,
    Parse,
    InvalidIdentifier,
}

impl From<&SourceError> for FailureKind {
    fn from(e: &SourceError) -> Self {
        match e {
            SourceError::Network(_) => FailureKind::Network,
            SourceError::Timeout(_) => FailureKind::Timeout,
            SourceError::Throttled { .. } => FailureKind::Throttled,
            SourceError::Parse(_) => FailureKind::Parse,
            SourceError::InvalidIdentifier(_) => FailureKind::InvalidIdentifier,
        }
    }
}

/// One adapter x variation trial, kept for diagnostics even on success.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    /// Adapter name (e.g. "retailer-search").
    pub source: String,
    /// The query text actually tried (original or a generated variation).
    pub tried: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Match { asin: Asin, confidence: f64 },
    NoMatch,
    Failed { error: FailureKind, detail: String },
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Outcome of a full lookup. `asin` present implies format-validated success.
#[derive(Debug, Clone, Serialize)]
pub struct LookupResult {
    pub query: LookupQuery,
    pub asin: Option<Asin>,
    /// Adapter that produced the identifier (or, on a cache hit, the adapter
    /// recorded when the entry was written).
    pub source: Option<String>,
    /// Meaningful only on success.
    pub confidence: f64,
    pub from_cache: bool,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    /// Every source/variation tried this call, in order. Empty on cache hits.
    pub attempts: Vec<Attempt>,
    /// Failure summary; absent on success.
    pub error: Option<String>,
}

impl LookupResult {
    pub fn is_success(&self) -> bool {
        self.asin.is_some()
    }
}
