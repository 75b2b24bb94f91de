//! Circuit breaker pattern for target resilience.
//!
//! Protects a target family from being hammered while it is failing, and
//! protects workers from waiting on calls that are bound to fail.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <---------------------------[M successes]------------------------+
//! ```
//!
//! Callers ask for admission with [`CircuitBreaker::allow`] and settle the
//! returned [`CallPermit`] with the outcome. While half-open only
//! `half_open_max_probes` permits are outstanding at once; a permit dropped
//! without an outcome hands its probe slot back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use url::Url;

use crate::error::AppError;
use crate::models::OutboundRequest;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - a limited number of probes test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Number of successful probes in half-open state to close the circuit.
    pub success_threshold: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub recovery_timeout: Duration,

    /// Probes admitted concurrently while half-open.
    pub half_open_max_probes: u32,

    /// When a 429 opens the circuit, multiply recovery_timeout by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Maximum recovery timeout after rate limit backoffs.
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_probes: 1,
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

/// Internal state tracking for the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_error_message: Option<String>,
    current_recovery_timeout: Duration,
    probes_in_flight: u32,
    /// Bumped on every entry into half-open; permits from older rounds are stale.
    probe_round: u64,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_error_message: None,
            current_recovery_timeout: config.recovery_timeout,
            probes_in_flight: 0,
            probe_round: 0,
        }
    }

    fn time_until_half_open(&self) -> Duration {
        self.opened_at
            .map(|t| self.current_recovery_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.current_recovery_timeout)
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub probes_in_flight: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Admission granted by [`CircuitBreaker::allow`].
///
/// Settle it with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping it unsettled records
/// nothing and frees the probe slot if it held one.
#[must_use = "a permit should be settled with an outcome"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    probe_round: Option<u64>,
}

impl CallPermit {
    /// True when this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe_round.is_some()
    }

    pub fn record_success(mut self) {
        let round = self.probe_round.take();
        let mut inner = self.breaker.lock_inner();
        let counts = self.breaker.release_probe(&mut inner, round);
        self.breaker.on_success(&mut inner, counts);
    }

    pub fn record_failure(mut self, error: &AppError) {
        let round = self.probe_round.take();
        let mut inner = self.breaker.lock_inner();
        let counts = self.breaker.release_probe(&mut inner, round);
        self.breaker.on_failure(&mut inner, error, counts);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if let Some(round) = self.probe_round.take() {
            let mut inner = self.breaker.lock_inner();
            self.breaker.release_probe(&mut inner, Some(round));
        }
    }
}

/// Thread-safe circuit breaker guarding one target family.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open =
            (inner.state == CircuitState::Open).then(|| inner.time_until_half_open());

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            probes_in_flight: inner.probes_in_flight,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
        }
    }

    /// Ask to make one call.
    ///
    /// - Closed: admitted
    /// - Open: `CircuitOpen` with the time left before a probe is allowed
    /// - HalfOpen: admitted as a probe while probe slots remain
    pub fn allow(&self) -> Result<CallPermit, AppError> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(CallPermit {
                breaker: self.clone(),
                probe_round: None,
            }),
            CircuitState::Open => Err(AppError::CircuitOpen {
                name: self.name.clone(),
                retry_after: inner.time_until_half_open(),
            }),
            CircuitState::HalfOpen => {
                if inner.probes_in_flight >= self.config.half_open_max_probes.max(1) {
                    return Err(AppError::CircuitOpen {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    });
                }
                inner.probes_in_flight += 1;
                tracing::debug!(
                    circuit = %self.name,
                    probes_in_flight = inner.probes_in_flight,
                    "Admitting half-open probe"
                );
                Ok(CallPermit {
                    breaker: self.clone(),
                    probe_round: Some(inner.probe_round),
                })
            }
        }
    }

    /// Record a success observed outside a permit.
    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        self.on_success(&mut inner, true);
    }

    /// Record a failure observed outside a permit.
    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        self.on_failure(&mut inner, error, true);
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        let round = inner.probe_round;
        *inner = CircuitBreakerInner::new(&self.config);
        inner.probe_round = round + 1;
    }

    /// Frees a probe slot. Returns whether the outcome should count toward
    /// half-open transitions.
    fn release_probe(&self, inner: &mut CircuitBreakerInner, round: Option<u64>) -> bool {
        match round {
            Some(r) if r == inner.probe_round && inner.state == CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                true
            }
            Some(_) => false,
            None => inner.state != CircuitState::HalfOpen,
        }
    }

    fn on_success(&self, inner: &mut CircuitBreakerInner, counts: bool) {
        match inner.state {
            CircuitState::HalfOpen if counts => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker closing after {} successful probes",
                        inner.success_count
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.probes_in_flight = 0;
                    inner.opened_at = None;
                    inner.last_error_message = None;
                    inner.current_recovery_timeout = self.config.recovery_timeout;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            _ => {}
        }
    }

    fn on_failure(&self, inner: &mut CircuitBreakerInner, error: &AppError, counts: bool) {
        let is_rate_limit = error.is_rate_limited();
        inner.last_error_message = Some(error.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;

                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    self.open(inner, is_rate_limit);
                }
            }
            CircuitState::HalfOpen if counts => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.success_count = 0;
                self.open(inner, is_rate_limit);
            }
            _ => {}
        }
    }

    fn open(&self, inner: &mut CircuitBreakerInner, is_rate_limit: bool) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probes_in_flight = 0;

        if is_rate_limit {
            inner.current_recovery_timeout = std::cmp::min(
                Duration::from_secs_f32(
                    inner.current_recovery_timeout.as_secs_f32()
                        * self.config.rate_limit_backoff_multiplier,
                ),
                self.config.max_recovery_timeout,
            );
            tracing::info!(
                circuit = %self.name,
                recovery_timeout_secs = inner.current_recovery_timeout.as_secs(),
                "Extended recovery timeout due to rate limit"
            );
        }
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= inner.current_recovery_timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.probes_in_flight = 0;
            inner.probe_round += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Registry: one breaker per key
// ---------------------------------------------------------------------------

/// Maps a request to the name of the breaker that guards it.
pub type KeyFn = Arc<dyn Fn(&OutboundRequest) -> String + Send + Sync>;

/// Extract the host key from a URL (scheme://host:port).
pub fn host_key(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    let host = url.host_str()?;
    let port = url
        .port_or_known_default()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    Some(format!("{}://{}{}", url.scheme(), host, port))
}

/// Default breaker scope: one breaker per target host.
pub fn per_host_key() -> KeyFn {
    Arc::new(|request: &OutboundRequest| {
        host_key(&request.url).unwrap_or_else(|| request.url.clone())
    })
}

/// Lazily creates and hands out one [`CircuitBreaker`] per key.
#[derive(Clone)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    key_fn: KeyFn,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Per-host scope.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_key_fn(config, per_host_key())
    }

    /// Custom scope.
    pub fn with_key_fn(config: CircuitBreakerConfig, key_fn: KeyFn) -> Self {
        Self {
            config,
            key_fn,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A single breaker shared by every request.
    pub fn shared(config: CircuitBreakerConfig, name: impl Into<String>) -> Self {
        let name = name.into();
        Self::with_key_fn(config, Arc::new(move |_: &OutboundRequest| name.clone()))
    }

    fn lock_breakers(&self) -> std::sync::MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned breaker registry mutex");
            poisoned.into_inner()
        })
    }

    pub fn key_for(&self, request: &OutboundRequest) -> String {
        (self.key_fn)(request)
    }

    pub fn breaker_for(&self, request: &OutboundRequest) -> CircuitBreaker {
        let key = self.key_for(request);
        self.lock_breakers()
            .entry(key.clone())
            .or_insert_with(|| CircuitBreaker::new(key, self.config.clone()))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<CircuitBreaker> {
        self.lock_breakers().get(key).cloned()
    }

    /// Stats for every breaker created so far, ordered by name.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<CircuitBreaker> = self.lock_breakers().values().cloned().collect();
        let mut stats: Vec<_> = breakers.iter().map(CircuitBreaker::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        let breakers: Vec<CircuitBreaker> = self.lock_breakers().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}
