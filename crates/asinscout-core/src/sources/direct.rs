//! Direct product-page probe by standard book number.
//!
//! The retailer serves `/dp/<isbn10>` for print editions and redirects (or
//! links) to the catalog identifier. Cheapest strategy and the most
//! trustworthy when it lands, so the orchestrator always tries it first for
//! queries that carry an ISBN.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{get_checked, AdapterOutcome, SourceAdapter, DIRECT_PROBE_CONFIDENCE};
use crate::{Asin, LookupQuery, SourceError};

/// `/dp/B…` path segment, in a redirect target or page body.
static DP_ASIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"/dp/(B[0-9A-Za-z]{9})").unwrap());

pub struct DirectProbe {
    host: String,
}

impl DirectProbe {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl SourceAdapter for DirectProbe {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn domain(&self) -> &'static str {
        "retailer"
    }

    fn requires_isbn(&self) -> bool {
        true
    }

    fn attempt<'a>(
        &'a self,
        query: &'a LookupQuery,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterOutcome, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            let Some(isbn10) = query.isbn().and_then(|i| i.to_isbn10()) else {
                return Ok(AdapterOutcome::NoMatch);
            };

            let url = format!("https://{}/dp/{}", self.host, isbn10);
            let resp = get_checked(client, &url, timeout).await?;

            if resp.status().as_u16() == 404 {
                return Ok(AdapterOutcome::NoMatch);
            }
            if !resp.status().is_success() {
                return Err(SourceError::Network(format!(
                    "unexpected status {} for {}",
                    resp.status(),
                    url
                )));
            }

            // The redirected URL usually carries the identifier already.
            if let Some(m) = DP_ASIN.captures(resp.url().path()) {
                if let Ok(asin) = Asin::parse(&m[1]) {
                    return Ok(AdapterOutcome::Match {
                        asin,
                        confidence: DIRECT_PROBE_CONFIDENCE,
                    });
                }
            }

            // Otherwise scan the page for an edition link (e.g. the Kindle
            // edition of the printed ISBN we probed).
            let body = resp.text().await?;
            for caps in DP_ASIN.captures_iter(&body) {
                if let Ok(asin) = Asin::parse(&caps[1]) {
                    return Ok(AdapterOutcome::Match {
                        asin,
                        // One step removed from the probe target.
                        confidence: DIRECT_PROBE_CONFIDENCE - 0.05,
                    });
                }
            }

            Ok(AdapterOutcome::NoMatch)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dp_pattern_extracts_and_validates() {
        let caps = DP_ASIN.captures("https://www.amazon.com/dp/B00ZVA3XL6?ref=x").unwrap();
        assert_eq!(Asin::parse(&caps[1]).unwrap().as_str(), "B00ZVA3XL6");
        // ISBN-shaped dp segments don't match the pattern at all
        assert!(DP_ASIN.captures("/dp/0765311788").is_none());
    }
}
