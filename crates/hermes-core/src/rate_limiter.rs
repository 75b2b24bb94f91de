//! Token-bucket rate limiting combined with an in-flight concurrency cap.
//!
//! Every outbound call holds a [`Lease`] for its duration. Acquiring a lease
//! takes a concurrency slot first and then a token from the bucket:
//!
//! ```text
//! acquire ──> semaphore slot ──> refill(elapsed * R, cap = 1 + burst) ──> tokens >= 1 ? take : sleep((1 - tokens) / R)
//! ```
//!
//! The bucket starts full, so any one-second window `[t, t + 1s)` grants at
//! most `max_requests_per_second + burst_size` leases. Dropping the lease
//! frees the slot. Consumed tokens are never refunded, even when the acquire
//! that consumed one is later cancelled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::AppError;

/// Smallest wait between token checks; keeps a starved waiter from spinning
/// on sub-millisecond deficits.
const MIN_TOKEN_WAIT: Duration = Duration::from_millis(1);

/// Limits for one [`RateLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained refill rate. Non-positive disables the token bucket.
    pub max_requests_per_second: f64,

    /// Maximum number of leases held at once.
    pub max_concurrent: usize,

    /// Extra tokens the bucket can hold above its single base token.
    pub burst_size: u32,
}

impl RateLimitConfig {
    pub fn new(max_requests_per_second: f64) -> Self {
        Self {
            max_requests_per_second,
            ..Self::default()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_burst(mut self, burst_size: u32) -> Self {
        self.burst_size = burst_size;
        self
    }

    fn capacity(&self) -> f64 {
        1.0 + self.burst_size as f64
    }

    fn throttled(&self) -> bool {
        self.max_requests_per_second.is_finite() && self.max_requests_per_second > 0.0
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 4.0,
            max_concurrent: 5,
            burst_size: 10,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Proof of admission. Holds one concurrency slot until dropped.
#[derive(Debug)]
pub struct Lease {
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// Give the slot back. Same as dropping the lease.
    pub fn release(self) {}
}

/// Shared token bucket plus concurrency semaphore.
///
/// Cheap to clone; clones share the same bucket and slots.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    slots: Arc<Semaphore>,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let slots = config.max_concurrent.max(1);
        let bucket = Bucket {
            tokens: config.capacity(),
            last_refill: Instant::now(),
        };
        Self {
            slots: Arc::new(Semaphore::new(slots)),
            bucket: Arc::new(Mutex::new(bucket)),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Leases currently held.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent.max(1) - self.slots.available_permits()
    }

    /// Tokens in the bucket right now, after refilling.
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.lock_bucket();
        bucket.refill(
            Instant::now(),
            self.config.max_requests_per_second,
            self.config.capacity(),
        );
        bucket.tokens
    }

    /// Wait for a slot and a token.
    ///
    /// With `timeout = None` this waits indefinitely. On expiry any slot
    /// already taken is released and `RateLimitTimeout` is returned.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<Lease, AppError> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.acquire_inner())
                .await
                .map_err(|_| {
                    tracing::debug!(waited_ms = limit.as_millis() as u64, "Rate limiter acquire timed out");
                    AppError::RateLimitTimeout { waited: limit }
                })?,
            None => self.acquire_inner().await,
        }
    }

    /// Return a lease. Equivalent to dropping it.
    pub fn release(&self, lease: Lease) {
        lease.release();
    }

    async fn acquire_inner(&self) -> Result<Lease, AppError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::ConfigError("rate limiter closed".into()))?;

        if !self.config.throttled() {
            return Ok(Lease { _permit: permit });
        }

        loop {
            let wait = self.try_take_token();
            match wait {
                None => return Ok(Lease { _permit: permit }),
                Some(wait) => {
                    tracing::debug!(sleep_ms = wait.as_millis() as u64, "Throttling request");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Take one token, or report how long until one is available.
    fn try_take_token(&self) -> Option<Duration> {
        let rate = self.config.max_requests_per_second;
        let mut bucket = self.lock_bucket();
        bucket.refill(Instant::now(), rate, self.config.capacity());

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            let deficit = Duration::from_secs_f64((1.0 - bucket.tokens) / rate);
            Some(deficit.max(MIN_TOKEN_WAIT))
        }
    }

    fn lock_bucket(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limiter mutex");
            poisoned.into_inner()
        })
    }
}
