pub mod checkpoint;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod failed_queue;
pub mod middleware;
pub mod models;
pub mod rate_limiter;
pub mod resume;
pub mod retry;
pub mod rotation;
pub mod runs;
pub mod store;
pub mod traits;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use checkpoint::{Checkpointer, ResumePoint, ResumeUpdate};
pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{MiddlewareConfig, Preset};
pub use error::AppError;
pub use failed_queue::{FailedTask, FailedTaskQueue, QueueConfig, TaskHandler};
pub use middleware::{Executed, MiddlewareStats, RequestMiddleware};
pub use models::{HttpResponse, Method, OutboundRequest, Route, compute_hash};
pub use rate_limiter::{Lease, RateLimitConfig, RateLimiter};
pub use resume::{Finding, IntegrityReport, ResumeCoordinator};
pub use retry::{AttemptRecord, Backoff, Outcome, RetryExecutor, RetryPolicy};
pub use runs::{CollectionRun, RunStatus, RunTracker};
pub use store::FileStore;
pub use traits::{CheckpointStore, FailedTaskStore, ItemLedger, NullLedger, RunStore, Transport};
pub use worker::{BatchItem, BatchSummary, BatchWorker, TracingBatchReporter};
