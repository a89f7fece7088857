//! Per-domain token buckets with exponential cooldown after throttling.
//!
//! Every upstream domain gets an independent budget: the scraped retailer is
//! deliberately kept far slower than the structured APIs, so a slow source
//! never drags the cheap ones down to its rate. Budgets are created lazily on
//! first use and live for the registry's lifetime.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::SourceError;

/// Type alias for governor's direct rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Statuses that trigger a domain cooldown.
pub fn is_throttle_status(status: u16) -> bool {
    status == 429 || status == 503
}

/// Token-bucket shape and backoff tuning for one domain.
#[derive(Debug, Clone)]
pub struct DomainProfile {
    /// Time between refilled tokens.
    pub refill_period: Duration,
    /// Bucket size: how many requests may burst before refills gate.
    pub burst: u32,
    /// First cooldown after a throttling response; doubles per strike.
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
}

impl DomainProfile {
    /// Default profile for a domain. The retailer is scraped, not queried
    /// through an API, and gets throttled hard enough to stay unremarkable.
    pub fn for_domain(domain: &str) -> Self {
        match domain {
            "retailer" => Self {
                refill_period: Duration::from_millis(2500),
                burst: 2,
                base_cooldown: Duration::from_secs(20),
                max_cooldown: Duration::from_secs(300),
            },
            "openlibrary" => Self {
                refill_period: Duration::from_millis(334),
                burst: 5,
                base_cooldown: Duration::from_secs(5),
                max_cooldown: Duration::from_secs(300),
            },
            "archive" => Self {
                refill_period: Duration::from_millis(500),
                burst: 4,
                base_cooldown: Duration::from_secs(5),
                max_cooldown: Duration::from_secs(300),
            },
            _ => Self {
                refill_period: Duration::from_secs(1),
                burst: 2,
                base_cooldown: Duration::from_secs(10),
                max_cooldown: Duration::from_secs(300),
            },
        }
    }

    fn quota(&self) -> Quota {
        let burst = NonZeroU32::new(self.burst.max(1)).expect("burst >= 1");
        Quota::with_period(self.refill_period)
            .expect("refill period must be > 0")
            .allow_burst(burst)
    }
}

/// Mutable rate state for a single domain: a governor token bucket plus the
/// strike counter and cooldown window driven by throttling responses.
pub struct DomainBudget {
    limiter: DirectLimiter,
    strikes: AtomicU32,
    cooldown_until: Mutex<Option<Instant>>,
    profile: DomainProfile,
}

impl DomainBudget {
    fn new(profile: DomainProfile) -> Self {
        Self {
            limiter: DirectLimiter::direct(profile.quota()),
            strikes: AtomicU32::new(0),
            cooldown_until: Mutex::new(None),
            profile,
        }
    }

    /// Wait for a token, or fail fast if the domain is cooling down.
    ///
    /// A cooldown means the upstream explicitly told us to go away; waiting
    /// it out inside a single query would stall the whole state machine, so
    /// the caller records a throttled attempt and moves to the next source.
    pub async fn acquire(&self) -> Result<(), SourceError> {
        if let Some(remaining) = self.cooldown_remaining() {
            return Err(SourceError::Throttled {
                retry_after: Some(remaining),
            });
        }
        self.limiter.until_ready().await;
        Ok(())
    }

    /// Time left in the current cooldown window, if any.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let guard = self.cooldown_until.lock().ok()?;
        let until = (*guard)?;
        until.checked_duration_since(Instant::now())
    }

    /// Register a throttling response: strike count grows, the cooldown
    /// doubles per strike (seeded by the profile's base, capped by its max),
    /// and an upstream `Retry-After` wins over the computed backoff.
    pub fn record_throttle(&self, retry_after: Option<Duration>) {
        let strikes = self.strikes.fetch_add(1, Ordering::SeqCst) + 1;
        let exponent = (strikes - 1).min(5);
        let backoff = self
            .profile
            .base_cooldown
            .saturating_mul(1u32 << exponent)
            .min(self.profile.max_cooldown);
        let jitter = Duration::from_millis(fastrand::u64(0..250));
        let cooldown = retry_after
            .unwrap_or(backoff)
            .min(self.profile.max_cooldown)
            + jitter;

        log::info!(
            "domain throttled (strike {strikes}), cooling down {:.1}s",
            cooldown.as_secs_f64()
        );
        if let Ok(mut guard) = self.cooldown_until.lock() {
            *guard = Some(Instant::now() + cooldown);
        }
    }

    /// A successful response clears strikes and any cooldown.
    pub fn record_success(&self) {
        self.strikes.store(0, Ordering::SeqCst);
        if let Ok(mut guard) = self.cooldown_until.lock() {
            *guard = None;
        }
    }

    #[cfg(test)]
    fn strikes(&self) -> u32 {
        self.strikes.load(Ordering::SeqCst)
    }
}

/// Registry of per-domain budgets. Injectable: the resolver owns one, tests
/// build their own; nothing here is process-global.
pub struct RateBudgetRegistry {
    budgets: DashMap<String, Arc<DomainBudget>>,
    overrides: HashMap<String, DomainProfile>,
}

impl Default for RateBudgetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RateBudgetRegistry {
    pub fn new() -> Self {
        Self {
            budgets: DashMap::new(),
            overrides: HashMap::new(),
        }
    }

    /// Replace the default profile for a domain (configuration hook).
    pub fn with_profile(mut self, domain: impl Into<String>, profile: DomainProfile) -> Self {
        self.overrides.insert(domain.into(), profile);
        self
    }

    /// The budget for a domain, created on first use.
    pub fn budget(&self, domain: &str) -> Arc<DomainBudget> {
        if let Some(existing) = self.budgets.get(domain) {
            return existing.clone();
        }
        let profile = self
            .overrides
            .get(domain)
            .cloned()
            .unwrap_or_else(|| DomainProfile::for_domain(domain));
        self.budgets
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainBudget::new(profile)))
            .clone()
    }

    /// Wait for a token on `domain`, failing fast during a cooldown.
    pub async fn acquire(&self, domain: &str) -> Result<(), SourceError> {
        // Clone out of the map before awaiting so no shard lock is held
        // across the suspension point.
        let budget = self.budget(domain);
        budget.acquire().await
    }

    /// Feed a response status back into the domain's budget.
    pub fn record_response(&self, domain: &str, status: u16) {
        if is_throttle_status(status) {
            self.budget(domain).record_throttle(None);
        } else if (200..400).contains(&status) {
            self.budget(domain).record_success();
        }
    }

    pub fn record_throttle(&self, domain: &str, retry_after: Option<Duration>) {
        self.budget(domain).record_throttle(retry_after);
    }

    pub fn record_success(&self, domain: &str) {
        self.budget(domain).record_success();
    }

    pub fn is_cooling_down(&self, domain: &str) -> bool {
        self.budget(domain).cooldown_remaining().is_some()
    }
}

/// Check an HTTP response for a throttling status, extracting `Retry-After`.
pub fn check_throttle_response(resp: &reqwest::Response) -> Result<(), SourceError> {
    let status = resp.status().as_u16();
    if is_throttle_status(status) {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(SourceError::Throttled { retry_after })
    } else {
        Ok(())
    }
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date form: a conservative fixed fallback beats date math here.
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_profile() -> DomainProfile {
        DomainProfile {
            refill_period: Duration::from_millis(1),
            burst: 100,
            base_cooldown: Duration::from_secs(10),
            max_cooldown: Duration::from_secs(40),
        }
    }

    #[tokio::test]
    async fn acquire_passes_when_not_throttled() {
        let budget = DomainBudget::new(fast_profile());
        assert!(budget.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn acquire_fails_fast_during_cooldown() {
        let budget = DomainBudget::new(fast_profile());
        budget.record_throttle(None);
        let err = budget.acquire().await.unwrap_err();
        assert!(matches!(err, SourceError::Throttled { .. }));
    }

    #[test]
    fn cooldown_doubles_per_strike_and_caps() {
        let budget = DomainBudget::new(fast_profile());

        budget.record_throttle(None);
        let first = budget.cooldown_remaining().unwrap();
        // base 10s (+ up to 250ms jitter)
        assert!(first <= Duration::from_secs(11));

        budget.record_throttle(None);
        let second = budget.cooldown_remaining().unwrap();
        assert!(second > first);

        for _ in 0..10 {
            budget.record_throttle(None);
        }
        // capped at max_cooldown + jitter
        assert!(budget.cooldown_remaining().unwrap() <= Duration::from_secs(41));
        assert_eq!(budget.strikes(), 12);
    }

    #[test]
    fn success_clears_cooldown_and_strikes() {
        let budget = DomainBudget::new(fast_profile());
        budget.record_throttle(None);
        assert!(budget.cooldown_remaining().is_some());

        budget.record_success();
        assert!(budget.cooldown_remaining().is_none());
        assert_eq!(budget.strikes(), 0);
    }

    #[test]
    fn retry_after_wins_over_backoff() {
        let budget = DomainBudget::new(fast_profile());
        budget.record_throttle(Some(Duration::from_secs(2)));
        let remaining = budget.cooldown_remaining().unwrap();
        assert!(remaining <= Duration::from_secs(3));
    }

    #[test]
    fn registry_creates_budgets_lazily_and_once() {
        let registry = RateBudgetRegistry::new();
        let a = registry.budget("retailer");
        let b = registry.budget("retailer");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn registry_record_response_throttles_only_that_domain() {
        let registry = RateBudgetRegistry::new();
        registry.record_response("retailer", 429);
        assert!(registry.is_cooling_down("retailer"));
        assert!(!registry.is_cooling_down("openlibrary"));

        registry.record_response("retailer", 200);
        assert!(!registry.is_cooling_down("retailer"));
    }

    #[test]
    fn parse_retry_after_forms() {
        assert_eq!(parse_retry_after("7"), Some(Duration::from_secs(7)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::from_secs(5))
        );
        assert_eq!(parse_retry_after("soon"), None);
    }
}
