//! Open Library search API adapter.
//!
//! Structured bibliographic records; editions frequently carry the
//! retailer's identifier in the `id_amazon` field.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;

use super::{get_checked, score_candidate, AdapterOutcome, SourceAdapter};
use crate::{Asin, LookupQuery, SourceError};

const DEFAULT_BASE: &str = "https://openlibrary.org";

pub struct OpenLibrary {
    base: String,
}

impl Default for OpenLibrary {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE.to_string(),
        }
    }
}

impl OpenLibrary {
    pub fn with_base(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    fn search_url(&self, query: &LookupQuery) -> String {
        let mut url = format!(
            "{}/search.json?fields=title,author_name,id_amazon&limit=10",
            self.base
        );
        if let Some(title) = query.title() {
            url.push_str("&title=");
            url.push_str(&urlencoding::encode(title));
            if let Some(author) = query.author() {
                url.push_str("&author=");
                url.push_str(&urlencoding::encode(author));
            }
        } else if let Some(isbn) = query.isbn() {
            url.push_str("&q=");
            url.push_str(&urlencoding::encode(isbn.as_str()));
        }
        url
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    docs: Vec<Doc>,
}

#[derive(Deserialize)]
struct Doc {
    title: Option<String>,
    #[serde(default)]
    author_name: Vec<String>,
    #[serde(default)]
    id_amazon: Vec<String>,
}

impl SourceAdapter for OpenLibrary {
    fn name(&self) -> &'static str {
        "openlibrary"
    }

    fn domain(&self) -> &'static str {
        "openlibrary"
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
                    "unexpected status {}",
                    resp.status()
                )));
            }

            let body = resp.text().await?;
            let parsed: SearchResponse = serde_json::from_str(&body)
                .map_err(|e| SourceError::Parse(format!("search payload: {e}")))?;

            Ok(best_doc(query, &parsed.docs))
        })
    }
}

fn best_doc(query: &LookupQuery, docs: &[Doc]) -> AdapterOutcome {
    let mut best: Option<(Asin, f64)> = None;
    for doc in docs {
        // Records without a retailer id can't answer the question no matter
        // how well they match.
        let Some(asin) = doc.id_amazon.iter().find_map(|id| Asin::parse(id).ok()) else {
            continue;
        };
        let title = doc.title.as_deref().unwrap_or_default();
        let score = score_candidate(query, title, doc.author_name.first().map(String::as_str));
        if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
            best = Some((asin, score));
        }
    }
    match best {
        Some((asin, confidence)) => AdapterOutcome::Match { asin, confidence },
        None => AdapterOutcome::NoMatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(title: &str, author: &str, ids: &[&str]) -> Doc {
        Doc {
            title: Some(title.to_string()),
            author_name: vec![author.to_string()],
            id_amazon: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn best_doc_prefers_closest_match() {
        let q = LookupQuery::from_title("Dune", Some("Frank Herbert".into())).unwrap();
        let docs = vec![
            doc("Dune Messiah", "Frank Herbert", &["B001892ON0"]),
            doc("Dune", "Frank Herbert", &["B00B7NPRY8"]),
        ];
        match best_doc(&q, &docs) {
            AdapterOutcome::Match { asin, confidence } => {
                assert_eq!(asin.as_str(), "B00B7NPRY8");
                assert!(confidence > 0.95);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn skips_docs_without_valid_ids() {
        let q = LookupQuery::from_title("Dune", None).unwrap();
        let docs = vec![
            doc("Dune", "Frank Herbert", &[]),
            doc("Dune", "Frank Herbert", &["0441172717"]),
        ];
        assert!(matches!(best_doc(&q, &docs), AdapterOutcome::NoMatch));
    }

    #[test]
    fn search_url_shapes() {
        let ol = OpenLibrary::default();
        let q = LookupQuery::from_title("Dune", Some("Frank Herbert".into())).unwrap();
        let url = ol.search_url(&q);
        assert!(url.contains("title=Dune"));
        assert!(url.contains("author=Frank%20Herbert"));

        let q = LookupQuery::from_isbn(crate::Isbn::parse("9780441172719").unwrap());
        assert!(ol.search_url(&q).contains("q=9780441172719"));
    }
}
