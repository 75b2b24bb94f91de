//! Outcome classification and backoff-with-jitter retries for one unit of work.
//!
//! Classification is a pure function of the attempt's result, so the retry
//! loop branches on an [`Outcome`] value rather than on which error type the
//! transport happened to produce.
//!
//! ```text
//! delay(n) = min(max_delay, base_delay * backoff_factor^n)      (n = retries so far)
//! jitter  => realized delay ~ uniform(0, delay(n))
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Transport failure kinds a policy can opt into retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Network,
    Timeout,
}

/// Classification of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Worth retrying locally (429/5xx, network, timeout).
    Transient,
    /// Surface immediately without retrying.
    Permanent,
}

/// Exponential backoff schedule shared by local retries and the failed-task queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Replace each delay with `uniform(0, delay)`.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Pre-jitter delay after `retry_count` retries have already happened.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = retry_count.min(1024) as i32;
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay to actually wait, with jitter applied when enabled.
    pub fn sample(&self, retry_count: u32) -> Duration {
        let delay = self.delay_for(retry_count);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let secs = rand::thread_rng().gen_range(0.0..=delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Immutable retry configuration for one middleware instance.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
    pub retryable_status_codes: BTreeSet<u16>,
    pub retryable_kinds: BTreeSet<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            retryable_status_codes: [429, 500, 502, 503, 504].into_iter().collect(),
            retryable_kinds: [FailureKind::Network, FailureKind::Timeout]
                .into_iter()
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Classify an attempt's result against this policy.
    ///
    /// Circuit-open and rate-limit-timeout errors are never retried locally:
    /// they classify as [`Outcome::Permanent`] and propagate to the caller.
    pub fn classify<T>(&self, result: &Result<T, AppError>) -> Outcome {
        let error = match result {
            Ok(_) => return Outcome::Success,
            Err(e) => e,
        };

        if let Some(status) = error.status_code() {
            return if self.retryable_status_codes.contains(&status) {
                Outcome::Transient
            } else {
                Outcome::Permanent
            };
        }

        match error.failure_kind() {
            Some(kind) if self.retryable_kinds.contains(&kind) => Outcome::Transient,
            _ => Outcome::Permanent,
        }
    }
}

/// What happened on one attempt, kept for the exhausted-retries report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-indexed attempt number.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Backoff waited before the next attempt, if there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

impl AttemptRecord {
    pub fn status(attempt: u32, status: u16, delay: Option<Duration>) -> Self {
        Self {
            attempt,
            status: Some(status),
            error: None,
            delay_ms: delay.map(|d| d.as_millis() as u64),
        }
    }

    pub fn error(attempt: u32, error: impl Into<String>, delay: Option<Duration>) -> Self {
        Self {
            attempt,
            status: None,
            error: Some(error.into()),
            delay_ms: delay.map(|d| d.as_millis() as u64),
        }
    }

    pub fn from_error(attempt: u32, error: &AppError, delay: Option<Duration>) -> Self {
        match error.status_code() {
            Some(status) => Self::status(attempt, status, delay),
            None => Self::error(attempt, error.to_string(), delay),
        }
    }

    pub fn describe(&self) -> String {
        match (&self.status, &self.error) {
            (Some(status), _) => format!("HTTP {status}"),
            (None, Some(error)) => error.clone(),
            (None, None) => "unknown".to_string(),
        }
    }
}

/// Runs one unit of work, retrying transient failures with backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `operation` until it succeeds, fails permanently, or runs out of retries.
    ///
    /// The operation receives the 1-indexed attempt number. Returns the value
    /// together with the number of attempts it took.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<(T, u32), AppError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut history = Vec::new();
        let mut retry_count = 0u32;

        loop {
            let attempt = retry_count + 1;
            let result = operation(attempt).await;

            let error = match (self.policy.classify(&result), result) {
                (_, Ok(value)) => return Ok((value, attempt)),
                (Outcome::Permanent, Err(e)) => return Err(e),
                (_, Err(e)) => e,
            };

            if retry_count >= self.policy.max_retries {
                history.push(AttemptRecord::from_error(attempt, &error, None));
                tracing::warn!(
                    attempts = attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(AppError::RetriesExhausted { attempts: history });
            }

            let delay = self.policy.backoff.sample(retry_count);
            history.push(AttemptRecord::from_error(attempt, &error, Some(delay)));
            tracing::info!(
                attempt,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }
}
