//! The single entry point for outbound calls.
//!
//! Each attempt runs, in order:
//!
//! ```text
//! breaker.allow ─> limiter.acquire ─> rotation ─> transport ─> status check
//!      ─> classify ─> breaker record ─> proxy health ─> lease dropped
//! ```
//!
//! and the [`RetryExecutor`] decides whether another attempt follows. A
//! request deadline bounds the whole call; when it passes, any pending wait is
//! abandoned and every held slot is released.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::circuit_breaker::{BreakerRegistry, CircuitBreakerStats};
use crate::config::MiddlewareConfig;
use crate::error::AppError;
use crate::models::{HttpResponse, Method, OutboundRequest, Route};
use crate::rate_limiter::RateLimiter;
use crate::retry::{Outcome, RetryExecutor};
use crate::rotation::{ProxyPool, ProxyStatus, UserAgentRotator};
use crate::traits::Transport;

/// A successful call and how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub response: HttpResponse,
    pub attempts: u32,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    retried_attempts: AtomicU64,
    circuit_rejections: AtomicU64,
    rate_limit_timeouts: AtomicU64,
}

/// Point-in-time view of the middleware counters.
#[derive(Debug, Clone, Serialize)]
pub struct MiddlewareStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retried_attempts: u64,
    pub circuit_rejections: u64,
    pub rate_limit_timeouts: u64,
    /// Successful over finished requests, 0.0 before any finished.
    pub success_rate: f64,
    pub in_flight: usize,
    pub breakers: Vec<CircuitBreakerStats>,
    pub proxies: Vec<ProxyStatus>,
}

/// Absolute deadline of one `execute` call and the budget it came from.
#[derive(Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

/// When the running attempt started waiting for a limiter slot, if it is
/// waiting right now.
#[derive(Default)]
struct SlotWait(Mutex<Option<Instant>>);

impl SlotWait {
    fn begin(&self) {
        *self.lock() = Some(Instant::now());
    }

    fn end(&self) {
        *self.lock() = None;
    }

    fn waited(&self) -> Option<Duration> {
        let since = *self.lock();
        since.map(|since| since.elapsed())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Instant>> {
        self.0.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned slot wait mutex");
            poisoned.into_inner()
        })
    }
}

/// Rate limiting, circuit breaking, retries and rotation around a [`Transport`].
///
/// Cheap to clone; clones share limiter, breakers and counters.
#[derive(Clone)]
pub struct RequestMiddleware<T> {
    transport: T,
    limiter: RateLimiter,
    breakers: BreakerRegistry,
    retry: RetryExecutor,
    acquire_timeout: Option<Duration>,
    user_agents: Option<UserAgentRotator>,
    proxies: Option<ProxyPool>,
    counters: Arc<Counters>,
}

impl<T: Transport> RequestMiddleware<T> {
    pub fn new(
        transport: T,
        limiter: RateLimiter,
        breakers: BreakerRegistry,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            transport,
            limiter,
            breakers,
            retry,
            acquire_timeout: None,
            user_agents: None,
            proxies: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Build every component from a validated config.
    pub fn from_config(transport: T, config: &MiddlewareConfig) -> Result<Self, AppError> {
        config.validate()?;
        let mut middleware = Self::new(
            transport,
            RateLimiter::new(config.rate_limit()),
            BreakerRegistry::new(config.circuit_breaker()),
            RetryExecutor::new(config.retry_policy()),
        );
        middleware.acquire_timeout = config.acquire_timeout();
        middleware.user_agents = config.user_agent_rotator();
        middleware.proxies = config.proxy_pool();
        Ok(middleware)
    }

    /// Fail acquires that wait longer than this with `RateLimitTimeout`.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn with_user_agents(mut self, rotator: UserAgentRotator) -> Self {
        self.user_agents = Some(rotator);
        self
    }

    pub fn with_proxies(mut self, pool: ProxyPool) -> Self {
        self.proxies = Some(pool);
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Run one request to completion.
    pub async fn execute(&self, request: &OutboundRequest) -> Result<Executed, AppError> {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let deadline = request.deadline.map(|budget| Deadline {
            at: Instant::now() + budget,
            budget,
        });

        let slot_wait = SlotWait::default();
        let run = self
            .retry
            .run(|attempt| self.attempt(request, attempt, deadline, &slot_wait));

        let result = match deadline {
            Some(d) => match tokio::time::timeout_at(d.at, run).await {
                Ok(result) => result,
                Err(_) => Err(self.expired(d, &slot_wait)),
            },
            None => run.await,
        };

        match &result {
            Ok((_, attempts)) => {
                self.counters.successful.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    method = %request.method,
                    url = %request.url,
                    attempts,
                    "Request succeeded"
                );
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    method = %request.method,
                    url = %request.url,
                    error = %e,
                    "Request failed"
                );
            }
        }

        result.map(|(response, attempts)| Executed { response, attempts })
    }

    /// Convenience form of [`execute`](Self::execute).
    pub async fn execute_with(
        &self,
        method: Method,
        url: &str,
        payload: Option<serde_json::Value>,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Executed, AppError> {
        let mut request = OutboundRequest::new(method, url);
        request.payload = payload;
        if let Some(headers) = headers {
            request = request.with_headers(headers);
        }
        self.execute(&request).await
    }

    async fn attempt(
        &self,
        request: &OutboundRequest,
        attempt: u32,
        deadline: Option<Deadline>,
        slot_wait: &SlotWait,
    ) -> Result<HttpResponse, AppError> {
        if attempt > 1 {
            self.counters.retried_attempts.fetch_add(1, Ordering::Relaxed);
        }

        let breaker = self.breakers.breaker_for(request);
        let permit = breaker.allow().inspect_err(|_| {
            self.counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
        })?;

        let _lease = self.acquire(deadline, slot_wait).await?;

        let route = Route {
            user_agent: self.user_agents.as_ref().and_then(UserAgentRotator::pick),
            proxy: self.proxies.as_ref().and_then(ProxyPool::pick),
        };
        tracing::debug!(
            method = %request.method,
            url = %request.url,
            attempt,
            proxy = route.proxy.as_deref().unwrap_or("direct"),
            "Sending request"
        );

        let sent = self.transport.send(request, &route).await;

        if let (Some(pool), Some(proxy)) = (&self.proxies, &route.proxy) {
            match &sent {
                Ok(_) => pool.record_success(proxy),
                Err(_) => pool.record_failure(proxy),
            }
        }

        let result = match sent {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => Err(AppError::HttpStatus {
                status: response.status,
                url: request.url.clone(),
            }),
            Err(e) => Err(e),
        };

        match (&result, self.retry.policy().classify(&result)) {
            (Ok(_), _) => permit.record_success(),
            (Err(e), Outcome::Transient) => permit.record_failure(e),
            // the target answered; nothing to hold against it
            _ => drop(permit),
        }

        result
    }

    async fn acquire(
        &self,
        deadline: Option<Deadline>,
        slot_wait: &SlotWait,
    ) -> Result<crate::rate_limiter::Lease, AppError> {
        let remaining = deadline.map(|d| d.at.saturating_duration_since(Instant::now()));
        let timeout = match (self.acquire_timeout, remaining) {
            (Some(limit), Some(left)) => Some(limit.min(left)),
            (limit, left) => limit.or(left),
        };

        slot_wait.begin();
        let acquired = self.limiter.acquire(timeout).await;
        slot_wait.end();

        acquired.inspect_err(|e| {
            if matches!(e, AppError::RateLimitTimeout { .. }) {
                self.counters.rate_limit_timeouts.fetch_add(1, Ordering::Relaxed);
            }
        })
    }

    /// The error for a call whose deadline passed. Expiry while waiting for a
    /// limiter slot is a rate-limit timeout.
    fn expired(&self, deadline: Deadline, slot_wait: &SlotWait) -> AppError {
        match slot_wait.waited() {
            Some(waited) => {
                self.counters.rate_limit_timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(waited_ms = waited.as_millis() as u64, "Deadline passed waiting for a slot");
                AppError::RateLimitTimeout { waited }
            }
            None => AppError::DeadlineExceeded(deadline.budget),
        }
    }

    pub fn stats(&self) -> MiddlewareStats {
        let successful = self.counters.successful.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let finished = successful + failed;

        MiddlewareStats {
            total_requests: self.counters.total.load(Ordering::Relaxed),
            successful_requests: successful,
            failed_requests: failed,
            retried_attempts: self.counters.retried_attempts.load(Ordering::Relaxed),
            circuit_rejections: self.counters.circuit_rejections.load(Ordering::Relaxed),
            rate_limit_timeouts: self.counters.rate_limit_timeouts.load(Ordering::Relaxed),
            success_rate: if finished == 0 {
                0.0
            } else {
                successful as f64 / finished as f64
            },
            in_flight: self.limiter.in_flight(),
            breakers: self.breakers.stats(),
            proxies: self
                .proxies
                .as_ref()
                .map(ProxyPool::statuses)
                .unwrap_or_default(),
        }
    }
}
