//! Retailer search-results scrape.
//!
//! The search page is treated as opaque markup: result containers are found
//! by their `data-asin` attribute, candidate titles by the heading inside
//! each container, and the best similarity-scored candidate wins. Fragile by
//! nature, which is why this adapter sits behind the most conservative rate
//! budget and why a structurally empty page is a `Parse` failure rather than
//! a clean no-match.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use once_cell::sync::Lazy;
use scraper::{Html, Selector};

use super::{get_checked, score_candidate, AdapterOutcome, SourceAdapter};
use crate::normalize::normalize;
use crate::{Asin, LookupQuery, SourceError};

static RESULT: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div[data-asin]").unwrap());
static HEADING: Lazy<Selector> = Lazy::new(|| Selector::parse("h2").unwrap());

/// Candidates scoring below this are noise, not matches.
const MIN_CANDIDATE_SCORE: f64 = 0.5;

pub struct RetailerSearch {
    host: String,
}

impl RetailerSearch {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    fn search_url(&self, query: &LookupQuery) -> String {
        let mut keywords = String::new();
        if let Some(title) = query.title() {
            keywords.push_str(title);
        }
        if let Some(author) = query.author() {
            if !keywords.is_empty() {
                keywords.push(' ');
            }
            keywords.push_str(author);
        }
        if keywords.is_empty() {
            if let Some(isbn) = query.isbn() {
                keywords.push_str(isbn.as_str());
            }
        }
        format!(
            "https://{}/s?k={}&i=stripbooks",
            self.host,
            urlencoding::encode(&keywords)
        )
    }
}

impl SourceAdapter for RetailerSearch {
    fn name(&self) -> &'static str {
        "retailer-search"
    }

    fn domain(&self) -> &'static str {
        "retailer"
    }

    fn attempt<'a>(
        &'a self,
        query: &'a LookupQuery,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterOutcome, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.search_url(query);
            let resp = get_checked(client, &url, timeout).await?;
            if !resp.status().is_success() {
                return Err(SourceError::Network(format!(
                    "unexpected status {} for search",
                    resp.status()
                )));
            }

            let body = resp.text().await?;
            let best = best_candidate(query, &body)?;
            Ok(match best {
                Some((asin, confidence)) => AdapterOutcome::Match { asin, confidence },
                None => AdapterOutcome::NoMatch,
            })
        })
    }
}

/// Extract and score every result container; return the best candidate above
/// the noise floor.
fn best_candidate(query: &LookupQuery, body: &str) -> Result<Option<(Asin, f64)>, SourceError> {
    let doc = Html::parse_document(body);

    let mut results = 0usize;
    let mut best: Option<(Asin, f64)> = None;
    for element in doc.select(&RESULT) {
        let Some(raw_asin) = element.value().attr("data-asin") else {
            continue;
        };
        if raw_asin.is_empty() {
            continue;
        }
        results += 1;

        // Sponsored slots and accessory listings carry non-catalog ids;
        // anything that fails validation is discarded, never returned.
        let Ok(asin) = Asin::parse(raw_asin) else {
            continue;
        };

        let Some(title_text) = element
            .select(&HEADING)
            .next()
            .map(|h| h.text().collect::<String>())
        else {
            continue;
        };

        // The heading rarely names the author; corroborate against the full
        // container text instead of punishing the candidate.
        let score = match query.author() {
            None => score_candidate(query, title_text.trim(), None),
            Some(author) => {
                let container_text = normalize(&element.text().collect::<String>());
                let surname = normalize(author);
                let surname = surname.rsplit(' ').next().unwrap_or_default();
                let corroborated = !surname.is_empty() && container_text.contains(surname);
                let title_part = super::TITLE_WEIGHT * score_title_only(query, title_text.trim());
                if corroborated {
                    title_part + super::AUTHOR_WEIGHT * 0.95
                } else {
                    title_part
                }
            }
        };

        if score >= MIN_CANDIDATE_SCORE
            && best.as_ref().map(|(_, s)| score > *s).unwrap_or(true)
        {
            best = Some((asin, score));
        }
    }

    if results == 0 && looks_like_interstitial(body) {
        return Err(SourceError::Parse(
            "search page served an interstitial instead of results".into(),
        ));
    }
    Ok(best)
}

fn score_title_only(query: &LookupQuery, candidate_title: &str) -> f64 {
    match query.title() {
        Some(t) => crate::normalize::title_match_score(t, candidate_title),
        None => 0.5,
    }
}

/// Robot checks and captive pages have no result containers but plenty of
/// tell-tale markup.
fn looks_like_interstitial(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("captcha") || lower.contains("robot check") || !lower.contains("<html")
}
