//! Lookup orchestration: cache check, prioritized source iteration,
//! variation expansion, persistence.
//!
//! The per-query state machine is a plain loop over an ordered adapter list
//! with one visible decision point: stop as soon as a result's confidence
//! reaches the acceptance threshold. Everything an adapter does wrong is
//! recovered here and recorded in the result's diagnostic trail; only total
//! exhaustion surfaces as a failed lookup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;

use crate::cache::{AsinCache, CacheError, CacheHit, CacheStats};
use crate::rate_limit::RateBudgetRegistry;
use crate::sources::{default_sources, AdapterOutcome, SourceAdapter};
use crate::variations::{variations, TitleIndex};
use crate::{Asin, Attempt, AttemptOutcome, FailureKind, LookupQuery, LookupResult, SourceError};

/// Orchestrator tuning. Flat key -> value configuration with documented
/// defaults; the CLI layers flag/env resolution on top.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Stop querying further sources once a result scores at least this.
    pub accept_threshold: f64,
    /// Similarity gate for fuzzy title-index variation candidates.
    pub fuzzy_threshold: f64,
    /// TTL for resolved identifiers.
    pub positive_ttl: Duration,
    /// TTL for exhaustion tombstones. Shorter than `positive_ttl`: absence
    /// changes as new editions appear.
    pub tombstone_ttl: Duration,
    /// Per-request timeout for each outbound adapter call.
    pub request_timeout: Duration,
    /// Upper bound on generated variations per query, original included.
    pub max_variations: usize,
    /// Hostname of the scraped retailer (regional storefronts differ).
    pub retailer_host: String,
    /// Worker count for `lookup_batch` when the caller passes 0.
    pub default_workers: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.85,
            fuzzy_threshold: 0.70,
            positive_ttl: Duration::from_secs(90 * 24 * 60 * 60),
            tombstone_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            request_timeout: Duration::from_secs(10),
            max_variations: 16,
            retailer_host: "www.amazon.com".to_string(),
            default_workers: 4,
        }
    }
}

/// Multi-source ASIN resolver.
///
/// Owns the shared HTTP client, the injectable rate-budget registry and the
/// optional persistent cache. Cheap to share behind an `Arc`; all methods
/// take `&self`.
pub struct Resolver {
    config: ResolverConfig,
    client: reqwest::Client,
    cache: Option<Arc<AsinCache>>,
    budgets: Arc<RateBudgetRegistry>,
    sources: Vec<Arc<dyn SourceAdapter>>,
    title_index: Option<Arc<TitleIndex>>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("asinscout/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("static client options are valid");
        let sources = default_sources(&config.retailer_host);
        Self {
            config,
            client,
            cache: None,
            budgets: Arc::new(RateBudgetRegistry::new()),
            sources,
            title_index: None,
        }
    }

    /// Attach a persistent cache. Without one, every lookup goes upstream.
    pub fn with_cache(mut self, cache: AsinCache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// Replace the adapter stack (order is priority order).
    pub fn with_sources(mut self, sources: Vec<Arc<dyn SourceAdapter>>) -> Self {
        self.sources = sources;
        self
    }

    /// Inject a rate-budget registry (shared across resolvers, or fresh per
    /// test).
    pub fn with_registry(mut self, registry: Arc<RateBudgetRegistry>) -> Self {
        self.budgets = registry;
        self
    }

    /// Known-title index enabling fuzzy variation rescue.
    pub fn with_title_index(mut self, index: TitleIndex) -> Self {
        self.title_index = Some(Arc::new(index));
        self
    }

    /// Resolve a single query with default sources and threshold.
    pub async fn lookup(&self, query: &LookupQuery) -> LookupResult {
        self.lookup_with(query, None, None).await
    }

    /// Resolve with an optional source-name subset and threshold override.
    pub async fn lookup_with(
        &self,
        query: &LookupQuery,
        sources: Option<&[&str]>,
        accept_threshold: Option<f64>,
    ) -> LookupResult {
        let started = Instant::now();
        let key = query.fingerprint();

        if let Some(result) = self.cached_result(query, &key, started) {
            return result;
        }

        let threshold = accept_threshold.unwrap_or(self.config.accept_threshold);
        let active: Vec<&Arc<dyn SourceAdapter>> = self
            .sources
            .iter()
            .filter(|s| sources.is_none_or(|names| names.contains(&s.name())))
            .collect();

        let variants = variations(
            query,
            self.title_index.as_deref(),
            self.config.fuzzy_threshold,
            self.config.max_variations,
        );

        let mut attempts: Vec<Attempt> = Vec::new();
        let mut best: Option<(Asin, f64, &'static str)> = None;

        'search: for (vi, variant) in variants.iter().enumerate() {
            for adapter in &active {
                // ISBN-only adapters repeat the identical request for every
                // variation; run them once, on the original pass.
                if adapter.requires_isbn() && (vi > 0 || variant.isbn().is_none()) {
                    continue;
                }
                if let Some((asin, confidence)) =
                    self.try_adapter(adapter.as_ref(), variant, &mut attempts).await
                {
                    let better = best
                        .as_ref()
                        .map(|(_, c, _)| confidence > *c)
                        .unwrap_or(true);
                    if better {
                        best = Some((asin, confidence, adapter.name()));
                    }
                    if confidence >= threshold {
                        break 'search;
                    }
                }
            }
        }

        // Persist: even a below-threshold result is a result once every
        // strategy has been exhausted; only a complete blank is tombstoned.
        let result = match best {
            Some((asin, confidence, source)) => {
                self.persist(&key, Some(&asin), Some(source), confidence);
                LookupResult {
                    query: query.clone(),
                    asin: Some(asin),
                    source: Some(source.to_string()),
                    confidence,
                    from_cache: false,
                    elapsed: started.elapsed(),
                    attempts,
                    error: None,
                }
            }
            None => {
                self.persist(&key, None, None, 0.0);
                let error = Some(summarize_failure(&attempts, variants.len()));
                LookupResult {
                    query: query.clone(),
                    asin: None,
                    source: None,
                    confidence: 0.0,
                    from_cache: false,
                    elapsed: started.elapsed(),
                    attempts,
                    error,
                }
            }
        };
        result
    }

    /// Resolve a batch, preserving input order in the returned vector.
    ///
    /// Queries already answerable from the cache are resolved inline first;
    /// the rest go to a bounded worker pool fed from a shared queue, and the
    /// indexed results are reassembled afterwards. One query's failure is
    /// its own failed entry, never the batch's.
    pub async fn lookup_batch(
        &self,
        queries: &[LookupQuery],
        max_workers: usize,
    ) -> Vec<LookupResult> {
        let mut results: Vec<Option<LookupResult>> = Vec::with_capacity(queries.len());
        results.resize_with(queries.len(), || None);

        let mut pending: Vec<usize> = Vec::new();
        for (i, query) in queries.iter().enumerate() {
            let started = Instant::now();
            let key = query.fingerprint();
            match self.cached_result(query, &key, started) {
                Some(hit) => results[i] = Some(hit),
                None => pending.push(i),
            }
        }

        if !pending.is_empty() {
            let workers = if max_workers == 0 {
                self.config.default_workers
            } else {
                max_workers
            }
            .min(pending.len());

            let (tx, rx) = async_channel::unbounded::<usize>();
            for i in pending {
                let _ = tx.try_send(i);
            }
            drop(tx);

            let worker_futures: Vec<_> = (0..workers)
                .map(|_| {
                    let rx = rx.clone();
                    async move {
                        let mut collected = Vec::new();
                        while let Ok(i) = rx.recv().await {
                            collected.push((i, self.lookup(&queries[i]).await));
                        }
                        collected
                    }
                })
                .collect();

            for chunk in join_all(worker_futures).await {
                for (i, result) in chunk {
                    results[i] = Some(result);
                }
            }
        }

        results
            .into_iter()
            .map(|r| r.expect("every batch index is either cached or dispatched"))
            .collect()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        let cache = self.cache.as_ref()?;
        match cache.stats() {
            Ok(stats) => Some(stats),
            Err(e) => {
                log::warn!("cache stats failed: {e}");
                None
            }
        }
    }

    pub fn cache_clear(&self) -> Result<(), CacheError> {
        match &self.cache {
            Some(cache) => cache.clear(),
            None => Ok(()),
        }
    }

    /// Remove expired rows from the cache, returning how many went away.
    pub fn cache_sweep(&self) -> Result<u64, CacheError> {
        match &self.cache {
            Some(cache) => cache.sweep_expired(),
            None => Ok(0),
        }
    }

    /// Cache read mapped into a finished result. Read failures log and fall
    /// through to a live lookup rather than failing the query.
    fn cached_result(
        &self,
        query: &LookupQuery,
        key: &str,
        started: Instant,
    ) -> Option<LookupResult> {
        let cache = self.cache.as_ref()?;
        let hit: CacheHit = match cache.get(key) {
            Ok(Some(hit)) => hit,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("cache read failed, continuing uncached: {e}");
                return None;
            }
        };

        let error = hit
            .asin
            .is_none()
            .then(|| "previous lookup exhausted all sources (cached tombstone)".to_string());
        Some(LookupResult {
            query: query.clone(),
            source: hit.source,
            confidence: hit.confidence,
            asin: hit.asin,
            from_cache: true,
            elapsed: started.elapsed(),
            attempts: Vec::new(),
            error,
        })
    }

    fn persist(&self, key: &str, asin: Option<&Asin>, source: Option<&str>, confidence: f64) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let ttl = if asin.is_some() {
            self.config.positive_ttl
        } else {
            self.config.tombstone_ttl
        };
        if let Err(e) = cache.put(key, asin, source, confidence, ttl) {
            log::warn!("cache write failed: {e}");
        }
    }

    /// One adapter against one query form: rate-limit gate, bounded call,
    /// one retry on transient failure, trail recording. Returns the match,
    /// if any; every path records an [`Attempt`].
    async fn try_adapter(
        &self,
        adapter: &dyn SourceAdapter,
        query: &LookupQuery,
        attempts: &mut Vec<Attempt>,
    ) -> Option<(Asin, f64)> {
        let domain = adapter.domain();
        let tried = query.describe();

        for retry in 0..2u8 {
            // A domain in cooldown fails here without a live request; the
            // query falls through to the next source.
            if let Err(e) = self.budgets.acquire(domain).await {
                attempts.push(failed_attempt(adapter.name(), &tried, &e));
                return None;
            }

            // The adapter applies `request_timeout` per HTTP call; the outer
            // bound catches adapters stuck outside network I/O.
            let outer = self.config.request_timeout + Duration::from_secs(1);
            let outcome =
                match tokio::time::timeout(outer, adapter.attempt(query, &self.client, self.config.request_timeout))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(SourceError::Timeout(self.config.request_timeout)),
                };

            match outcome {
                Ok(AdapterOutcome::Match { asin, confidence }) => {
                    self.budgets.record_success(domain);
                    attempts.push(Attempt {
                        source: adapter.name().to_string(),
                        tried,
                        outcome: AttemptOutcome::Match {
                            asin: asin.clone(),
                            confidence,
                        },
                    });
                    return Some((asin, confidence));
                }
                Ok(AdapterOutcome::NoMatch) => {
                    self.budgets.record_success(domain);
                    attempts.push(Attempt {
                        source: adapter.name().to_string(),
                        tried,
                        outcome: AttemptOutcome::NoMatch,
                    });
                    return None;
                }
                Err(SourceError::Throttled { retry_after }) => {
                    self.budgets.record_throttle(domain, retry_after);
                    let e = SourceError::Throttled { retry_after };
                    attempts.push(failed_attempt(adapter.name(), &tried, &e));
                    return None;
                }
                Err(e) if e.is_transient() && retry == 0 => {
                    log::debug!("{}: transient failure, retrying once: {e}", adapter.name());
                    attempts.push(failed_attempt(adapter.name(), &tried, &e));
                }
                Err(e) => {
                    attempts.push(failed_attempt(adapter.name(), &tried, &e));
                    return None;
                }
            }
        }
        None
    }
}

fn failed_attempt(source: &str, tried: &str, error: &SourceError) -> Attempt {
    Attempt {
        source: source.to_string(),
        tried: tried.to_string(),
        outcome: AttemptOutcome::Failed {
            error: FailureKind::from(error),
            detail: error.to_string(),
        },
    }
}

/// Compress the trail into a one-line failure summary: the last outcome per
/// source, in first-tried order.
fn summarize_failure(attempts: &[Attempt], variant_count: usize) -> String {
    let mut order: Vec<&str> = Vec::new();
    for a in attempts {
        if !order.contains(&a.source.as_str()) {
            order.push(a.source.as_str());
        }
    }
    let per_source: Vec<String> = order
        .iter()
        .map(|source| {
            let last = attempts
                .iter()
                .rev()
                .find(|a| a.source == *source)
                .expect("source came from this list");
            let what = match &last.outcome {
                AttemptOutcome::Match { confidence, .. } => {
                    format!("low-confidence match ({confidence:.2})")
                }
                AttemptOutcome::NoMatch => "no match".to_string(),
                AttemptOutcome::Failed { detail, .. } => detail.clone(),
            };
            format!("{source}: {what}")
        })
        .collect();
    if per_source.is_empty() {
        "no sources were available to query".to_string()
    } else {
        format!(
            "no identifier found after {} query form(s); {}",
            variant_count,
            per_source.join("; ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::mock::MockAdapter;

    fn query(title: &str, author: Option<&str>) -> LookupQuery {
        LookupQuery::from_title(title, author.map(String::from)).unwrap()
    }

    fn fast_config() -> ResolverConfig {
        ResolverConfig {
            request_timeout: Duration::from_secs(2),
            ..ResolverConfig::default()
        }
    }

    /// Wide-open token buckets so tests never wait on refills; cooldowns
    /// stay long enough to observe.
    fn fast_registry() -> Arc<RateBudgetRegistry> {
        let profile = crate::rate_limit::DomainProfile {
            refill_period: Duration::from_millis(1),
            burst: 10_000,
            base_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(120),
        };
        Arc::new(
            RateBudgetRegistry::new()
                .with_profile("retailer", profile.clone())
                .with_profile("openlibrary", profile),
        )
    }

    fn resolver_with(sources: Vec<Arc<dyn SourceAdapter>>) -> Resolver {
        Resolver::new(fast_config())
            .with_sources(sources)
            .with_registry(fast_registry())
    }

    fn cached_resolver(
        dir: &tempfile::TempDir,
        sources: Vec<Arc<dyn SourceAdapter>>,
    ) -> Resolver {
        let cache = AsinCache::open(&dir.path().join("cache.db")).unwrap();
        resolver_with(sources).with_cache(cache)
    }

    #[tokio::test]
    async fn exact_hit_then_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let retailer = Arc::new(
            MockAdapter::new("retailer-search", "retailer").with_entry(
                "Dune",
                Some("Frank Herbert"),
                "B00B7NPRY8",
            ),
        );
        let resolver = cached_resolver(&dir, vec![retailer.clone()]);
        let q = query("Dune", Some("Frank Herbert"));

        let first = resolver.lookup(&q).await;
        assert!(first.is_success());
        assert!(!first.from_cache);
        assert_eq!(first.source.as_deref(), Some("retailer-search"));
        assert_eq!(first.asin.as_ref().unwrap().as_str(), "B00B7NPRY8");
        assert!(!first.attempts.is_empty());

        let second = resolver.lookup(&q).await;
        assert!(second.from_cache);
        assert_eq!(second.asin, first.asin);
        assert_eq!(second.source, first.source);
        // No further adapter traffic for the repeat query.
        assert_eq!(retailer.calls(), 1);
    }

    #[tokio::test]
    async fn success_identifier_passes_format_validation() {
        let retailer = Arc::new(
            MockAdapter::new("retailer-search", "retailer").with_entry("Dune", None, "b00b7npry8"),
        );
        let resolver = resolver_with(vec![retailer]);
        let result = resolver.lookup(&query("Dune", None)).await;
        let asin = result.asin.unwrap();
        assert!(asin.as_str().starts_with('B'));
        assert_eq!(asin.as_str().len(), 10);
        assert!(asin.as_str().chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn early_termination_skips_later_sources() {
        let first = Arc::new(
            MockAdapter::new("retailer-search", "retailer").with_entry(
                "Dune",
                Some("Frank Herbert"),
                "B00B7NPRY8",
            ),
        );
        let second = Arc::new(MockAdapter::new("openlibrary", "openlibrary"));
        let resolver = resolver_with(vec![first.clone(), second.clone()]);

        let result = resolver.lookup(&query("Dune", Some("Frank Herbert"))).await;
        assert!(result.is_success());
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0, "threshold met, later source must not run");
    }

    #[tokio::test]
    async fn below_threshold_consults_all_sources_and_keeps_best() {
        let weak = Arc::new(
            MockAdapter::new("retailer-search", "retailer").with_script(Ok(
                AdapterOutcome::Match {
                    asin: Asin::parse("B000000001").unwrap(),
                    confidence: 0.6,
                },
            )),
        );
        let better = Arc::new(
            MockAdapter::new("openlibrary", "openlibrary").with_script(Ok(
                AdapterOutcome::Match {
                    asin: Asin::parse("B000000002").unwrap(),
                    confidence: 0.7,
                },
            )),
        );
        let resolver = resolver_with(vec![weak.clone(), better.clone()]);

        let result = resolver.lookup(&query("Obscure Title", None)).await;
        // Best-effort: highest confidence wins even though it never reached
        // the acceptance threshold.
        assert!(result.is_success());
        assert_eq!(result.asin.as_ref().unwrap().as_str(), "B000000002");
        assert!((result.confidence - 0.7).abs() < 1e-9);
        assert!(weak.calls() >= 1);
        assert!(better.calls() >= 1);
    }

    #[tokio::test]
    async fn variation_rescue_via_title_index() {
        let adapter = Arc::new(
            MockAdapter::new("retailer-search", "retailer").with_entry(
                "Mistborn: The Final Empire",
                Some("Brandon Sanderson"),
                "B002GYI9C4",
            ),
        );
        let index = TitleIndex::new(vec!["Mistborn: The Final Empire".to_string()]);
        let resolver = resolver_with(vec![adapter.clone()]).with_title_index(index);

        let result = resolver
            .lookup(&query("Final Empire", Some("B. Sanderson")))
            .await;
        assert!(result.is_success(), "error: {:?}", result.error);
        assert_eq!(result.asin.unwrap().as_str(), "B002GYI9C4");
        assert!(
            adapter.calls() > 1,
            "the original form misses; a variation must have been tried"
        );
    }

    #[tokio::test]
    async fn exhaustion_writes_tombstone_and_repeat_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::new("retailer-search", "retailer"));
        let resolver = cached_resolver(&dir, vec![adapter.clone()]);
        let q = query("Book That Does Not Exist", Some("Nobody"));

        let first = resolver.lookup(&q).await;
        assert!(!first.is_success());
        assert!(first.error.is_some());
        assert!(!first.attempts.is_empty());
        let calls_after_first = adapter.calls();
        assert!(calls_after_first >= 1);

        let second = resolver.lookup(&q).await;
        assert!(!second.is_success());
        assert!(second.from_cache);
        assert_eq!(
            adapter.calls(),
            calls_after_first,
            "tombstone hit must not re-invoke any adapter"
        );
    }

    #[tokio::test]
    async fn throttled_domain_cools_down_and_falls_through() {
        let retailer = Arc::new(
            MockAdapter::new("retailer-search", "retailer")
                .with_script(Err(SourceError::Throttled { retry_after: None }))
                .with_entry("Dune", None, "B00B7NPRY8"),
        );
        let fallback = Arc::new(
            MockAdapter::new("openlibrary", "openlibrary").with_entry("Dune", None, "B0DUNEOL99"),
        );
        let resolver = resolver_with(vec![retailer.clone(), fallback.clone()]);

        // First query: retailer answers with a throttle, fallback resolves.
        let first = resolver.lookup(&query("Dune", None)).await;
        assert!(first.is_success());
        assert_eq!(first.source.as_deref(), Some("openlibrary"));
        assert_eq!(retailer.calls(), 1);

        // Second query inside the cooldown window: no live request to the
        // throttled domain, straight to the next source.
        let second = resolver.lookup(&query("Dune", None)).await;
        assert!(second.is_success());
        assert_eq!(retailer.calls(), 1, "cooled-down domain must not be queried");
        let throttled_attempt = second
            .attempts
            .iter()
            .find(|a| a.source == "retailer-search")
            .unwrap();
        assert!(matches!(
            throttled_attempt.outcome,
            AttemptOutcome::Failed {
                error: FailureKind::Throttled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn transient_failure_retries_once_then_moves_on() {
        let flaky = Arc::new(
            MockAdapter::new("retailer-search", "retailer")
                .with_script(Err(SourceError::Network("connection reset".into())))
                .with_entry("Dune", None, "B00B7NPRY8"),
        );
        let resolver = resolver_with(vec![flaky.clone()]);

        let result = resolver.lookup(&query("Dune", None)).await;
        // Retry happened and succeeded against the index.
        assert!(result.is_success());
        assert_eq!(flaky.calls(), 2);
        assert!(matches!(
            result.attempts[0].outcome,
            AttemptOutcome::Failed {
                error: FailureKind::Network,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn parse_failure_is_not_retried() {
        let broken = Arc::new(
            MockAdapter::new("retailer-search", "retailer")
                .with_script(Err(SourceError::Parse("interstitial".into()))),
        );
        let fallback = Arc::new(
            MockAdapter::new("openlibrary", "openlibrary").with_entry("Dune", None, "B00B7NPRY8"),
        );
        let resolver = resolver_with(vec![broken.clone(), fallback]);

        let result = resolver.lookup(&query("Dune", None)).await;
        assert!(result.is_success());
        assert_eq!(broken.calls(), 1, "parse failures move on immediately");
    }

    #[tokio::test]
    async fn source_subset_restricts_adapters() {
        let retailer = Arc::new(
            MockAdapter::new("retailer-search", "retailer").with_entry("Dune", None, "B00B7NPRY8"),
        );
        let openlib = Arc::new(
            MockAdapter::new("openlibrary", "openlibrary").with_entry("Dune", None, "B0DUNEOL99"),
        );
        let resolver = resolver_with(vec![retailer.clone(), openlib.clone()]);

        let result = resolver
            .lookup_with(&query("Dune", None), Some(&["openlibrary"]), None)
            .await;
        assert_eq!(result.source.as_deref(), Some("openlibrary"));
        assert_eq!(retailer.calls(), 0);
    }

    #[tokio::test]
    async fn threshold_override_keeps_searching() {
        let retailer = Arc::new(
            MockAdapter::new("retailer-search", "retailer").with_entry("Dune", None, "B00B7NPRY8"),
        );
        let openlib = Arc::new(MockAdapter::new("openlibrary", "openlibrary"));
        let resolver = resolver_with(vec![retailer.clone(), openlib.clone()]);

        // Uncorroborated title-only match scores 0.9; a 0.99 bar forces the
        // iteration to continue past it.
        let result = resolver
            .lookup_with(&query("Dune", None), None, Some(0.99))
            .await;
        assert!(result.is_success());
        assert!(openlib.calls() >= 1);
    }

    #[tokio::test]
    async fn isbn_only_adapter_runs_once_and_only_with_isbn() {
        let direct = Arc::new(MockAdapter::new("direct", "retailer").requiring_isbn());
        let resolver = resolver_with(vec![direct.clone()]);

        let no_isbn = query("Dune", None);
        let _ = resolver.lookup(&no_isbn).await;
        assert_eq!(direct.calls(), 0);

        let with_isbn = LookupQuery::new(
            Some("Dune".into()),
            None,
            Some(crate::Isbn::parse("9780441172719").unwrap()),
        )
        .unwrap();
        let _ = resolver.lookup(&with_isbn).await;
        // Many variations were generated, but the ISBN adapter ran once.
        assert_eq!(direct.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batch_preserves_input_order_under_random_latency() {
        let titles = ["Dune", "Hyperion", "Elantris", "Wool", "Kindred", "Blindsight"];
        let mut adapter = MockAdapter::new("retailer-search", "retailer").with_latency_ms(1, 40);
        for (i, t) in titles.iter().enumerate() {
            adapter = adapter.with_entry(t, None, &format!("B00000000{i}"));
        }
        let resolver = resolver_with(vec![Arc::new(adapter)]);

        let queries: Vec<LookupQuery> =
            titles.iter().map(|t| query(t, None)).collect();
        let results = resolver.lookup_batch(&queries, 4).await;

        assert_eq!(results.len(), queries.len());
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.query, queries[i], "order must match input");
            assert_eq!(
                result.asin.as_ref().unwrap().as_str(),
                format!("B00000000{i}")
            );
        }
    }

    #[tokio::test]
    async fn batch_serves_cached_entries_without_adapter_calls() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(
            MockAdapter::new("retailer-search", "retailer")
                .with_entry("Dune", None, "B000000001")
                .with_entry("Wool", None, "B000000002"),
        );
        let resolver = cached_resolver(&dir, vec![adapter.clone()]);

        // Prime the cache with one of the two.
        let _ = resolver.lookup(&query("Dune", None)).await;
        let calls_after_prime = adapter.calls();

        let queries = vec![query("Dune", None), query("Wool", None)];
        let results = resolver.lookup_batch(&queries, 2).await;

        assert!(results[0].from_cache);
        assert!(!results[1].from_cache);
        // Only the uncached query generated traffic.
        assert_eq!(adapter.calls(), calls_after_prime + 1);
    }

    #[tokio::test]
    async fn batch_failure_degrades_to_entry_not_batch() {
        let adapter = Arc::new(
            MockAdapter::new("retailer-search", "retailer")
                .with_entry("Dune", None, "B000000001"),
        );
        let resolver = resolver_with(vec![adapter]);

        let queries = vec![query("Dune", None), query("No Such Book", None)];
        let results = resolver.lookup_batch(&queries, 2).await;
        assert!(results[0].is_success());
        assert!(!results[1].is_success());
        assert!(results[1].error.is_some());
    }

    #[tokio::test]
    async fn uncached_resolver_still_resolves() {
        let adapter = Arc::new(
            MockAdapter::new("retailer-search", "retailer").with_entry("Dune", None, "B000000001"),
        );
        let resolver = resolver_with(vec![adapter]);
        assert!(resolver.cache_stats().is_none());
        let result = resolver.lookup(&query("Dune", None)).await;
        assert!(result.is_success());
        assert!(!result.from_cache);
    }

    #[tokio::test]
    async fn failure_summary_names_sources() {
        let a = Arc::new(MockAdapter::new("retailer-search", "retailer"));
        let b = Arc::new(
            MockAdapter::new("openlibrary", "openlibrary")
                .with_script(Err(SourceError::Parse("bad payload".into()))),
        );
        let resolver = resolver_with(vec![a, b]);

        let result = resolver.lookup(&query("Nothing Here", None)).await;
        let error = result.error.unwrap();
        assert!(error.contains("retailer-search"));
        assert!(error.contains("openlibrary"));
    }
}
