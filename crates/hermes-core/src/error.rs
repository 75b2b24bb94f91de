use std::time::Duration;

use thiserror::Error;

use crate::retry::{AttemptRecord, FailureKind};

/// Application-wide error types for Hermes.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed for a reason other than a timeout or a refused connection.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The target answered, but with a non-success status code.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// No token or concurrency slot became available within the caller's timeout.
    #[error("Rate limiter acquire timed out after {}ms", .waited.as_millis())]
    RateLimitTimeout { waited: Duration },

    /// Circuit is open - the request was rejected without being attempted.
    #[error("Circuit breaker '{name}' is open. Retry after {} seconds.", .retry_after.as_secs())]
    CircuitOpen { name: String, retry_after: Duration },

    /// Local retries ran out. Carries one record per attempt.
    #[error("Retries exhausted after {} attempts (last: {})", .attempts.len(), last_failure(.attempts))]
    RetriesExhausted { attempts: Vec<AttemptRecord> },

    /// The caller-supplied deadline for `execute` passed.
    #[error("Deadline of {}ms exceeded", .0.as_millis())]
    DeadlineExceeded(Duration),

    /// A checkpoint or failed-task write did not reach durable storage.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A failed-task handler reported an error.
    #[error("Handler error: {0}")]
    HandlerError(String),
}

fn last_failure(attempts: &[AttemptRecord]) -> String {
    attempts
        .last()
        .map(|a| a.describe())
        .unwrap_or_else(|| "none".to_string())
}

impl AppError {
    /// HTTP status carried by this error, if the target answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Transport-level failure kind, used to match against a retry policy.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            AppError::NetworkError(_) => Some(FailureKind::Network),
            AppError::Timeout(_) => Some(FailureKind::Timeout),
            AppError::HttpError(msg) => {
                let msg = msg.to_lowercase();
                if msg.contains("timeout") || msg.contains("timed out") {
                    Some(FailureKind::Timeout)
                } else if msg.contains("connect") || msg.contains("reset") {
                    Some(FailureKind::Network)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Returns true for a 429 from the target.
    pub fn is_rate_limited(&self) -> bool {
        self.status_code() == Some(429)
    }

    /// Returns true if the work is worth handing to the failed-task queue
    /// for a later, out-of-band attempt.
    pub fn is_retry_later(&self) -> bool {
        matches!(
            self,
            AppError::RetriesExhausted { .. }
                | AppError::CircuitOpen { .. }
                | AppError::RateLimitTimeout { .. }
                | AppError::DeadlineExceeded(_)
        )
    }

    /// Attempt history for exhausted retries, empty otherwise.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            AppError::RetriesExhausted { attempts } => attempts,
            _ => &[],
        }
    }
}
