//! Per-model pacing with exponential backoff, plus a process-wide pacing
//! floor. Waiters on the same model queue on the limiter's mutex, so pacing
//! is serialized per model without any global ordering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

use crate::upstream::UpstreamError;

const BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 3;
const MIN_INTERVAL: Duration = Duration::from_millis(50);
const GLOBAL_WAIT: Duration = Duration::from_millis(50);

/// Substring rules for classifying upstream error text. Fragile against
/// upstream wording changes; every rule lives in these two tables.
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "429", "too many requests", "quota exceeded"];
const PERMANENT_MARKERS: &[&str] = &[
    "404",
    "not found",
    "no endpoints found",
    "model not available",
    "model does not exist",
];

pub fn is_rate_limit_error(err: &UpstreamError) -> bool {
    let text = err.to_string().to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| text.contains(marker))
}

pub fn is_permanent_error(err: &UpstreamError) -> bool {
    let text = err.to_string().to_lowercase();
    PERMANENT_MARKERS.iter().any(|marker| text.contains(marker))
}

#[derive(Debug, Default)]
struct LimiterState {
    last_request: Option<Instant>,
    backoff_until: Option<Instant>,
    failure_count: u32,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cooperative pacing. Sleeps out an active backoff, otherwise enforces
    /// the minimum inter-request gap. Holding the state lock across the sleep
    /// is what serializes concurrent waiters on the same model.
    pub async fn wait(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some(until) = state.backoff_until {
            if now < until {
                debug!(wait_ms = (until - now).as_millis() as u64, "backoff wait");
                sleep_until(until).await;
                return;
            }
        }

        if let Some(last) = state.last_request {
            let elapsed = now.duration_since(last);
            if elapsed < MIN_INTERVAL {
                sleep(MIN_INTERVAL - elapsed).await;
            }
        }

        state.last_request = Some(Instant::now());
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.failure_count = 0;
        state.backoff_until = None;
    }

    /// Counts every failure; only rate-limit failures arm the backoff.
    pub async fn record_failure(&self, err: &UpstreamError) {
        let mut state = self.state.lock().await;
        state.failure_count += 1;

        if is_rate_limit_error(err) {
            let backoff = backoff_with_jitter(state.failure_count);
            state.backoff_until = Some(Instant::now() + backoff);
            warn!(
                backoff_ms = backoff.as_millis() as u64,
                failures = state.failure_count,
                "rate limit detected, backing off"
            );
        }
    }

    pub async fn should_retry(&self) -> bool {
        self.state.lock().await.failure_count < MAX_RETRIES
    }
}

/// `base * 2^(failures-1)` capped at the max, with +/-12.5% jitter.
fn backoff_with_jitter(failure_count: u32) -> Duration {
    let exponent = failure_count.saturating_sub(1).min(31);
    let raw = BASE_DELAY.as_secs_f64() * f64::from(2u32.saturating_pow(exponent));
    let capped = raw.min(MAX_DELAY.as_secs_f64());

    let r: f64 = rand::rng().random();
    let jittered = capped + capped * 0.25 * (0.5 - r);
    Duration::from_secs_f64(jittered.max(0.0))
}

/// Lazily materializes one limiter per model and enforces the global
/// inter-request floor across all of them.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
    last_global: Mutex<Option<Instant>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, model: &str) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().await;
        limiters
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new()))
            .clone()
    }

    /// At least `GLOBAL_WAIT` elapses between any two upstream requests,
    /// whatever model they target.
    pub async fn wait_global(&self) {
        let mut last = self.last_global.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < GLOBAL_WAIT {
                sleep(GLOBAL_WAIT - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(status: u16, message: &str) -> UpstreamError {
        UpstreamError::Api {
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn rate_limit_classification_table() {
        assert!(is_rate_limit_error(&api_error(429, "Too Many Requests")));
        assert!(is_rate_limit_error(&api_error(
            200,
            "provider quota exceeded"
        )));
        assert!(is_rate_limit_error(&UpstreamError::Transport(
            "Rate Limit hit".to_string()
        )));
        assert!(!is_rate_limit_error(&api_error(500, "internal error")));
    }

    #[test]
    fn permanent_classification_table() {
        assert!(is_permanent_error(&api_error(404, "Not Found")));
        assert!(is_permanent_error(&api_error(
            502,
            "No endpoints found for this model"
        )));
        assert!(is_permanent_error(&api_error(400, "model does not exist")));
        assert!(!is_permanent_error(&api_error(500, "flaky upstream")));
    }

    #[test]
    fn backoff_grows_and_saturates() {
        for _ in 0..20 {
            let first = backoff_with_jitter(1);
            assert!(first >= Duration::from_millis(87));
            assert!(first <= Duration::from_millis(113));

            let deep = backoff_with_jitter(30);
            assert!(deep >= Duration::from_millis(8_750));
            assert!(deep <= Duration::from_millis(11_250));
        }
    }

    #[tokio::test]
    async fn wait_enforces_min_interval() {
        let limiter = RateLimiter::new();
        limiter.wait().await;
        let started = Instant::now();
        limiter.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn rate_limit_failure_arms_backoff() {
        let limiter = RateLimiter::new();
        limiter.record_failure(&api_error(429, "too many requests")).await;

        let started = Instant::now();
        limiter.wait().await;
        // First backoff step is ~100ms with +/-12.5% jitter.
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn success_clears_backoff() {
        let limiter = RateLimiter::new();
        limiter.record_failure(&api_error(429, "too many requests")).await;
        limiter.record_success().await;

        let started = Instant::now();
        limiter.wait().await;
        assert!(started.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn plain_failures_do_not_back_off() {
        let limiter = RateLimiter::new();
        limiter.record_failure(&api_error(500, "boom")).await;

        let started = Instant::now();
        limiter.wait().await;
        assert!(started.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn retry_budget() {
        let limiter = RateLimiter::new();
        assert!(limiter.should_retry().await);
        for _ in 0..3 {
            limiter.record_failure(&api_error(500, "boom")).await;
        }
        assert!(!limiter.should_retry().await);
    }

    #[tokio::test]
    async fn registry_reuses_limiters_per_model() {
        let registry = RateLimiterRegistry::new();
        let a = registry.get("v/a").await;
        let b = registry.get("v/a").await;
        let c = registry.get("v/c").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn global_wait_spaces_requests() {
        let registry = RateLimiterRegistry::new();
        registry.wait_global().await;
        let started = Instant::now();
        registry.wait_global().await;
        assert!(started.elapsed() >= Duration::from_millis(45));
    }
}
