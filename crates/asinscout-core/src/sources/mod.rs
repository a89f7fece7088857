//! Source adapter trait and implementations for resolving ASINs.

pub mod archive;
pub mod direct;
pub mod openlibrary;
pub mod retailer;

#[cfg(test)]
pub(crate) mod mock;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::normalize::{author_similarity, title_match_score};
use crate::rate_limit::check_throttle_response;
use crate::{Asin, LookupQuery, SourceError};

/// What a single adapter attempt produced.
#[derive(Debug, Clone)]
pub enum AdapterOutcome {
    /// A validated identifier and the adapter's confidence in it.
    Match { asin: Asin, confidence: f64 },
    /// The source answered but holds no matching record.
    NoMatch,
}

/// An upstream data source that can resolve a query to an ASIN.
///
/// Adapters are pure lookup functions over shared HTTP state; all rate
/// limiting, retrying and result policy lives in the orchestrator.
pub trait SourceAdapter: Send + Sync {
    /// Stable adapter name recorded in results (e.g. "retailer-search").
    fn name(&self) -> &'static str;

    /// Rate-limit key: adapters hitting the same upstream host share one
    /// budget regardless of strategy.
    fn domain(&self) -> &'static str;

    /// Whether this adapter can only work from a standard book number.
    /// Such adapters run once per query; generated variations never change
    /// the ISBN, so re-running them would repeat the identical request.
    fn requires_isbn(&self) -> bool {
        false
    }

    /// Attempt to resolve `query`. Every candidate identifier must pass
    /// [`Asin::parse`] before being returned.
    fn attempt<'a>(
        &'a self,
        query: &'a LookupQuery,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterOutcome, SourceError>> + Send + 'a>>;
}

/// The default adapter stack in priority order: the direct probe is cheapest
/// and near-authoritative; the scraped search is broad; the structured APIs
/// back-stop with slower-moving catalog data.
pub fn default_sources(retailer_host: &str) -> Vec<std::sync::Arc<dyn SourceAdapter>> {
    vec![
        std::sync::Arc::new(direct::DirectProbe::new(retailer_host)),
        std::sync::Arc::new(retailer::RetailerSearch::new(retailer_host)),
        std::sync::Arc::new(openlibrary::OpenLibrary::default()),
        std::sync::Arc::new(archive::ArchiveCatalog::default()),
    ]
}

// Confidence blend. Tunable constants validated by the end-to-end scenario
// tests rather than derived from any upstream formula.
pub(crate) const TITLE_WEIGHT: f64 = 0.75;
pub(crate) const AUTHOR_WEIGHT: f64 = 0.25;
/// Applied when no author is available on either side to corroborate a
/// title-only match.
pub(crate) const UNCORROBORATED_SCALE: f64 = 0.9;
/// The retailer's own ISBN redirect: near-authoritative, but the ISBN may
/// bind to a different edition than the one asked about.
pub(crate) const DIRECT_PROBE_CONFIDENCE: f64 = 0.95;

/// Score a candidate record against the query.
pub(crate) fn score_candidate(
    query: &LookupQuery,
    candidate_title: &str,
    candidate_author: Option<&str>,
) -> f64 {
    let Some(title) = query.title() else {
        // ISBN-only query matched through a search API: the record is
        // plausible but nothing textual corroborates it.
        return 0.5;
    };
    let title_score = title_match_score(title, candidate_title);
    match (query.author(), candidate_author) {
        (Some(qa), Some(ca)) => {
            TITLE_WEIGHT * title_score + AUTHOR_WEIGHT * author_similarity(qa, ca)
        }
        _ => title_score * UNCORROBORATED_SCALE,
    }
}

/// GET `url`, mapping timeouts and throttling statuses into the error
/// taxonomy. Non-throttle HTTP failures are left to the caller: a 404 means
/// different things to different adapters.
pub(crate) async fn get_checked(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<reqwest::Response, SourceError> {
    let resp = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout(timeout)
            } else {
                SourceError::Network(e.to_string())
            }
        })?;
    check_throttle_response(&resp)?;
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_exact_match_clears_threshold() {
        let q = LookupQuery::from_title("Dune", Some("Frank Herbert".into())).unwrap();
        let s = score_candidate(&q, "Dune", Some("Frank Herbert"));
        assert!(s > 0.99);
    }

    #[test]
    fn score_uncorroborated_is_scaled() {
        let q = LookupQuery::from_title("Dune", None).unwrap();
        let s = score_candidate(&q, "Dune", Some("Frank Herbert"));
        assert!((s - UNCORROBORATED_SCALE).abs() < 1e-9);
    }

    #[test]
    fn score_abbreviated_author_still_accepts() {
        let q = LookupQuery::from_title(
            "Mistborn: The Final Empire",
            Some("B. Sanderson".into()),
        )
        .unwrap();
        let s = score_candidate(&q, "Mistborn: The Final Empire", Some("Brandon Sanderson"));
        assert!(s >= 0.85, "abbreviated author should clear acceptance: {s}");
    }

    #[test]
    fn score_wrong_book_stays_low() {
        let q = LookupQuery::from_title("Dune", Some("Frank Herbert".into())).unwrap();
        let s = score_candidate(&q, "Wool", Some("Hugh Howey"));
        assert!(s < 0.5);
    }
}
