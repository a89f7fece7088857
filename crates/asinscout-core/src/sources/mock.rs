//! Scripted in-memory adapter for orchestrator tests. No network.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{score_candidate, AdapterOutcome, SourceAdapter};
use crate::normalize::{author_similarity, normalize};
use crate::{Asin, LookupQuery, SourceError};

struct MockEntry {
    title: String,
    author: Option<String>,
    asin: Asin,
}

/// Test double: answers from an indexed title list, or from a scripted queue
/// of outcomes, counting every call. Matching is exact on the normalized
/// title (variations must do the real work) with abbreviation-tolerant
/// author checking.
pub(crate) struct MockAdapter {
    name: &'static str,
    domain: &'static str,
    requires_isbn: bool,
    entries: Vec<MockEntry>,
    scripted: Mutex<VecDeque<Result<AdapterOutcome, SourceError>>>,
    latency_ms: Option<(u64, u64)>,
    calls: AtomicUsize,
}

impl MockAdapter {
    pub(crate) fn new(name: &'static str, domain: &'static str) -> Self {
        Self {
            name,
            domain,
            requires_isbn: false,
            entries: Vec::new(),
            scripted: Mutex::new(VecDeque::new()),
            latency_ms: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_entry(mut self, title: &str, author: Option<&str>, asin: &str) -> Self {
        self.entries.push(MockEntry {
            title: title.to_string(),
            author: author.map(String::from),
            asin: Asin::parse(asin).unwrap(),
        });
        self
    }

    /// Queue an outcome returned (in order) before any index matching.
    pub(crate) fn with_script(self, outcome: Result<AdapterOutcome, SourceError>) -> Self {
        self.scripted.lock().unwrap().push_back(outcome);
        self
    }

    /// Random per-call latency, for completion-order shuffling.
    pub(crate) fn with_latency_ms(mut self, min: u64, max: u64) -> Self {
        self.latency_ms = Some((min, max));
        self
    }

    pub(crate) fn requiring_isbn(mut self) -> Self {
        self.requires_isbn = true;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lookup_index(&self, query: &LookupQuery) -> AdapterOutcome {
        let Some(title) = query.title() else {
            return AdapterOutcome::NoMatch;
        };
        for entry in &self.entries {
            if normalize(title) != normalize(&entry.title) {
                continue;
            }
            let authors_agree = match (query.author(), entry.author.as_deref()) {
                (Some(qa), Some(ea)) => author_similarity(qa, ea) >= 0.5,
                _ => true,
            };
            if authors_agree {
                let confidence = score_candidate(query, &entry.title, entry.author.as_deref());
                return AdapterOutcome::Match {
                    asin: entry.asin.clone(),
                    confidence,
                };
            }
        }
        AdapterOutcome::NoMatch
    }
}

impl SourceAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn domain(&self) -> &'static str {
        self.domain
    }

    fn requires_isbn(&self) -> bool {
        self.requires_isbn
    }

    fn attempt<'a>(
        &'a self,
        query: &'a LookupQuery,
        _client: &'a reqwest::Client,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterOutcome, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((min, max)) = self.latency_ms {
                tokio::time::sleep(Duration::from_millis(fastrand::u64(min..=max))).await;
            }
            if let Some(outcome) = self.scripted.lock().unwrap().pop_front() {
                return outcome;
            }
            Ok(self.lookup_index(query))
        })
    }
}
