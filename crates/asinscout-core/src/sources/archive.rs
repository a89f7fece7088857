//! Internet Archive library-catalog adapter.
//!
//! The advanced-search endpoint returns catalog records whose
//! `external-identifier` field may carry a `urn:asin:` entry. Field values
//! are string-or-array depending on the record, so the payload is walked as
//! loose JSON rather than forced through rigid structs.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;

use super::{get_checked, score_candidate, AdapterOutcome, SourceAdapter};
use crate::{Asin, LookupQuery, SourceError};

const DEFAULT_BASE: &str = "https://archive.org";

pub struct ArchiveCatalog {
    base: String,
}

impl Default for ArchiveCatalog {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE.to_string(),
        }
    }
}

impl ArchiveCatalog {
    pub fn with_base(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    fn search_url(&self, query: &LookupQuery) -> String {
        let q = match (query.title(), query.author(), query.isbn()) {
            (Some(t), Some(a), _) => format!("title:(\"{t}\") AND creator:(\"{a}\")"),
            (Some(t), None, _) => format!("title:(\"{t}\")"),
            (None, _, Some(i)) => format!("isbn:{}", i.as_str()),
            (None, _, None) => String::new(),
        };
        format!(
            "{}/advancedsearch.php?q={}&fl[]=title&fl[]=creator&fl[]=external-identifier&rows=10&output=json",
            self.base,
            urlencoding::encode(&q)
        )
    }
}

impl SourceAdapter for ArchiveCatalog {
    fn name(&self) -> &'static str {
        "archive-catalog"
    }

    fn domain(&self) -> &'static str {
        "archive"
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
            let value: Value = serde_json::from_str(&body)
                .map_err(|e| SourceError::Parse(format!("catalog payload: {e}")))?;
            let docs = value
                .pointer("/response/docs")
                .and_then(Value::as_array)
                .ok_or_else(|| SourceError::Parse("catalog payload missing docs".into()))?;

            Ok(best_doc(query, docs))
        })
    }
}

fn best_doc(query: &LookupQuery, docs: &[Value]) -> AdapterOutcome {
    let mut best: Option<(Asin, f64)> = None;
    for doc in docs {
        let Some(asin) = first_asin(doc.get("external-identifier")) else {
            continue;
        };
        let title = doc
            .get("title")
            .map(flattened_strings)
            .unwrap_or_default()
            .into_iter()
            .next()
            .unwrap_or_default();
        let creator = doc
            .get("creator")
            .map(flattened_strings)
            .unwrap_or_default()
            .into_iter()
            .next();
        let score = score_candidate(query, &title, creator.as_deref());
        if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
            best = Some((asin, score));
        }
    }
    match best {
        Some((asin, confidence)) => AdapterOutcome::Match { asin, confidence },
        None => AdapterOutcome::NoMatch,
    }
}

/// A field that is sometimes a string, sometimes an array of strings.
fn flattened_strings(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn first_asin(field: Option<&Value>) -> Option<Asin> {
    let values = field.map(flattened_strings)?;
    values
        .iter()
        .filter_map(|v| v.strip_prefix("urn:asin:"))
        .find_map(|raw| Asin::parse(raw).ok())
}
