//! The free-mode routing engine: one direct attempt against the requested
//! model, then an ordered sweep of the pool, with every failure fed back into
//! the trackers that shape the next request's routing.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use orproxy_protocol::openai::{ChatCompletion, ChatMessage};
use orproxy_storage::{FailureClass, FailureStore};

use crate::limit::{is_permanent_error, is_rate_limit_error, RateLimiterRegistry};
use crate::pool::{display_name, ModelFilter};
use crate::tracker::PermanentFailureTracker;
use crate::upstream::{ChatStream, Upstream, UpstreamError};

/// Breather between candidates after a rate-limit failure, so the sweep does
/// not hammer the next provider in the same burst.
const RATE_LIMIT_ADVANCE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("all models failed: {0}")]
    AllModelsFailed(#[source] UpstreamError),
    #[error("no free models available")]
    NoFreeModels,
}

pub struct RouterEngine {
    upstream: Arc<dyn Upstream>,
    failures: FailureStore,
    limiters: RateLimiterRegistry,
    permanent: PermanentFailureTracker,
    pool: Vec<String>,
    filter: ModelFilter,
}

impl RouterEngine {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        failures: FailureStore,
        pool: Vec<String>,
        filter: ModelFilter,
    ) -> Self {
        Self {
            upstream,
            failures,
            limiters: RateLimiterRegistry::new(),
            permanent: PermanentFailureTracker::new(),
            pool,
            filter,
        }
    }

    pub fn pool(&self) -> &[String] {
        &self.pool
    }

    pub fn filter(&self) -> &ModelFilter {
        &self.filter
    }

    pub fn permanent_failures(&self) -> &PermanentFailureTracker {
        &self.permanent
    }

    pub fn failures(&self) -> &FailureStore {
        &self.failures
    }

    /// Pool entries a client should currently see: filtered, not cooling
    /// down, not permanently failed.
    pub async fn visible_pool(&self) -> Vec<String> {
        let mut visible = Vec::new();
        for model in &self.pool {
            if self.permanent.is_permanently_failed(model) {
                continue;
            }
            if !self.filter.matches(display_name(model)) {
                continue;
            }
            match self.failures.should_skip(model).await {
                Ok(false) => visible.push(model.clone()),
                Ok(true) => {}
                Err(err) => {
                    warn!(model = %model, error = %err, "failure store read failed");
                }
            }
        }
        visible
    }

    /// Map a display name to its pool entry (honoring the filter); unknown
    /// names come back unchanged.
    pub fn resolve_display_name(&self, requested: &str) -> String {
        for model in &self.pool {
            let display = display_name(model);
            if display == requested && self.filter.matches(display) {
                return model.clone();
            }
        }
        requested.to_string()
    }

    pub async fn chat_for_model(
        &self,
        messages: &[ChatMessage],
        requested: &str,
    ) -> Result<(ChatCompletion, String), RouteError> {
        if let Some(resolved) = self.direct_candidate(requested).await {
            match self.upstream.chat(messages, &resolved).await {
                Ok(response) => {
                    self.clear_failure(&resolved).await;
                    return Ok((response, resolved));
                }
                Err(err) => {
                    // The direct attempt only marks the store; limiter
                    // bookkeeping is reserved for the pool sweep.
                    debug!(model = %resolved, error = %err, "direct attempt failed");
                    self.mark_failure(&resolved, FailureClass::General).await;
                }
            }
        }
        self.chat(messages).await
    }

    pub async fn stream_for_model(
        &self,
        messages: &[ChatMessage],
        requested: &str,
    ) -> Result<(ChatStream, String), RouteError> {
        if let Some(resolved) = self.direct_candidate(requested).await {
            match self.upstream.chat_stream(messages, &resolved).await {
                Ok(stream) => {
                    self.clear_failure(&resolved).await;
                    return Ok((stream, resolved));
                }
                Err(err) => {
                    debug!(model = %resolved, error = %err, "direct attempt failed");
                    self.mark_failure(&resolved, FailureClass::General).await;
                }
            }
        }
        self.stream(messages).await
    }

    /// Ordered sweep, buffered mode.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
    ) -> Result<(ChatCompletion, String), RouteError> {
        let mut last_error = None;

        for model in &self.pool {
            if !self.sweep_candidate(model).await {
                continue;
            }

            let limiter = self.limiters.get(model).await;
            limiter.wait().await;
            self.limiters.wait_global().await;

            match self.upstream.chat(messages, model).await {
                Ok(response) => {
                    limiter.record_success().await;
                    self.clear_failure(model).await;
                    return Ok((response, model.clone()));
                }
                Err(err) => {
                    limiter.record_failure(&err).await;
                    self.note_failure(model, &err).await;
                    last_error = Some(err);
                }
            }
        }

        Err(exhausted(last_error))
    }

    /// Ordered sweep, streaming mode. Failover only happens here, before any
    /// byte reaches the client; once a stream handle is returned, errors on
    /// it terminate the response instead of retrying.
    pub async fn stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<(ChatStream, String), RouteError> {
        let mut last_error = None;

        for model in &self.pool {
            if !self.sweep_candidate(model).await {
                continue;
            }

            let limiter = self.limiters.get(model).await;
            limiter.wait().await;
            self.limiters.wait_global().await;

            match self.upstream.chat_stream(messages, model).await {
                Ok(stream) => {
                    limiter.record_success().await;
                    self.clear_failure(model).await;
                    return Ok((stream, model.clone()));
                }
                Err(err) => {
                    limiter.record_failure(&err).await;
                    self.note_failure(model, &err).await;
                    last_error = Some(err);
                }
            }
        }

        Err(exhausted(last_error))
    }

    /// The direct attempt runs when the requested name resolved to a pool
    /// entry, or is itself a pool member, and is not cooling down. A store
    /// read error skips the direct attempt rather than failing the request.
    async fn direct_candidate(&self, requested: &str) -> Option<String> {
        let resolved = self.resolve_display_name(requested);
        if resolved == requested && !self.pool.iter().any(|m| m == requested) {
            return None;
        }
        match self.failures.should_skip(&resolved).await {
            Ok(false) => Some(resolved),
            _ => None,
        }
    }

    async fn sweep_candidate(&self, model: &str) -> bool {
        if self.permanent.is_permanently_failed(model) {
            return false;
        }
        if !self.filter.matches(display_name(model)) {
            return false;
        }
        matches!(self.failures.should_skip(model).await, Ok(false))
    }

    async fn note_failure(&self, model: &str, err: &UpstreamError) {
        if is_permanent_error(err) {
            self.permanent.mark_permanent(model);
        } else if is_rate_limit_error(err) {
            self.mark_failure(model, FailureClass::RateLimit).await;
            sleep(RATE_LIMIT_ADVANCE_DELAY).await;
        } else {
            self.mark_failure(model, FailureClass::General).await;
        }
    }

    async fn mark_failure(&self, model: &str, class: FailureClass) {
        if let Err(err) = self.failures.mark_with_class(model, class).await {
            warn!(model, error = %err, "failed to record failure");
        }
    }

    async fn clear_failure(&self, model: &str) {
        if let Err(err) = self.failures.clear(model).await {
            warn!(model, error = %err, "failed to clear failure record");
        }
    }
}

fn exhausted(last_error: Option<UpstreamError>) -> RouteError {
    match last_error {
        Some(err) => RouteError::AllModelsFailed(err),
        None => RouteError::NoFreeModels,
    }
}
