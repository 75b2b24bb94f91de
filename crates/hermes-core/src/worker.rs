use std::future::Future;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::failed_queue::{FailedTask, FailedTaskQueue};
use crate::middleware::RequestMiddleware;
use crate::models::{HttpResponse, OutboundRequest};
use crate::traits::{FailedTaskStore, Transport};

/// Metadata key holding the serialized request of a queued task.
pub const REQUEST_METADATA_KEY: &str = "request";

/// Metadata key holding the attempt history of a queued task.
pub const ATTEMPTS_METADATA_KEY: &str = "attempts";

/// One unit of batch work: a stable target identifier and the call that fetches it.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub target: String,
    pub request: OutboundRequest,
}

impl BatchItem {
    pub fn new(target: impl Into<String>, request: OutboundRequest) -> Self {
        Self {
            target: target.into(),
            request,
        }
    }

    /// A GET of `url`, with the URL as target.
    pub fn get(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(url.clone(), OutboundRequest::get(url))
    }
}

/// Events emitted by the batch worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum BatchEvent<'a> {
    Started {
        task_type: &'a str,
        items: usize,
    },
    ItemSucceeded {
        target: &'a str,
        attempts: u32,
    },
    ItemQueued {
        target: &'a str,
        task_id: &'a str,
        error: &'a str,
    },
    ItemFailed {
        target: &'a str,
        error: &'a str,
    },
    Cancelled {
        skipped: usize,
    },
    Finished {
        summary: &'a BatchSummary,
    },
}

/// Trait for receiving batch events (decoupled logging).
pub trait BatchReporter: Send + Sync {
    fn report(&self, event: BatchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBatchReporter;

impl BatchReporter for TracingBatchReporter {
    fn report(&self, event: BatchEvent<'_>) {
        match event {
            BatchEvent::Started { task_type, items } => {
                tracing::info!(%task_type, items, "Batch started");
            }
            BatchEvent::ItemSucceeded { target, attempts } => {
                tracing::debug!(%target, attempts, "Item succeeded");
            }
            BatchEvent::ItemQueued {
                target,
                task_id,
                error,
            } => {
                tracing::warn!(%target, %task_id, %error, "Item queued for later retry");
            }
            BatchEvent::ItemFailed { target, error } => {
                tracing::warn!(%target, %error, "Item failed permanently");
            }
            BatchEvent::Cancelled { skipped } => {
                tracing::info!(skipped, "Batch cancelled");
            }
            BatchEvent::Finished { summary } => {
                tracing::info!(
                    succeeded = summary.succeeded,
                    queued = summary.queued,
                    failed = summary.failed.len(),
                    skipped = summary.skipped,
                    "Batch finished"
                );
            }
        }
    }
}

/// A target that will not be retried, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub target: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    /// Handed to the failed-task queue.
    pub queued: usize,
    pub failed: Vec<BatchFailure>,
    /// Not started because the batch was cancelled.
    pub skipped: usize,
}

enum ItemOutcome {
    Succeeded,
    Queued,
    Failed(BatchFailure),
    Skipped,
}

/// Runs batches of [`BatchItem`]s through a [`RequestMiddleware`], handing
/// retry-later failures to a [`FailedTaskQueue`].
pub struct BatchWorker<T, S> {
    middleware: RequestMiddleware<T>,
    queue: FailedTaskQueue<S>,
    task_type: String,
    max_workers: usize,
    max_task_retries: u32,
}

impl<T, S> BatchWorker<T, S>
where
    T: Transport,
    S: FailedTaskStore,
{
    pub fn new(
        middleware: RequestMiddleware<T>,
        queue: FailedTaskQueue<S>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            middleware,
            queue,
            task_type: task_type.into(),
            max_workers: 5,
            max_task_retries: 3,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Out-of-band retries granted to each queued task.
    pub fn with_max_task_retries(mut self, max_task_retries: u32) -> Self {
        self.max_task_retries = max_task_retries;
        self
    }

    /// Run every item, at most `max_workers` at a time.
    ///
    /// `on_response` receives each successful response; an error from it
    /// counts the item as failed. Items not yet started when `cancel_token`
    /// fires are skipped, items in flight run to completion.
    pub async fn run<H, Fut, R>(
        &self,
        items: Vec<BatchItem>,
        on_response: H,
        cancel_token: CancellationToken,
        reporter: &R,
    ) -> BatchSummary
    where
        H: Fn(BatchItem, HttpResponse) -> Fut + Sync,
        Fut: Future<Output = Result<(), AppError>> + Send,
        R: BatchReporter,
    {
        reporter.report(BatchEvent::Started {
            task_type: &self.task_type,
            items: items.len(),
        });

        let outcomes: Vec<ItemOutcome> = futures::stream::iter(items)
            .map(|item| self.process(item, &on_response, &cancel_token, reporter))
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        let mut summary = BatchSummary::default();
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Succeeded => summary.succeeded += 1,
                ItemOutcome::Queued => summary.queued += 1,
                ItemOutcome::Failed(failure) => summary.failed.push(failure),
                ItemOutcome::Skipped => summary.skipped += 1,
            }
        }

        if summary.skipped > 0 {
            reporter.report(BatchEvent::Cancelled {
                skipped: summary.skipped,
            });
        }
        reporter.report(BatchEvent::Finished { summary: &summary });
        summary
    }

    async fn process<H, Fut, R>(
        &self,
        item: BatchItem,
        on_response: &H,
        cancel_token: &CancellationToken,
        reporter: &R,
    ) -> ItemOutcome
    where
        H: Fn(BatchItem, HttpResponse) -> Fut + Sync,
        Fut: Future<Output = Result<(), AppError>> + Send,
        R: BatchReporter,
    {
        if cancel_token.is_cancelled() {
            return ItemOutcome::Skipped;
        }

        match self.middleware.execute(&item.request).await {
            Ok(executed) => {
                let target = item.target.clone();
                match on_response(item, executed.response).await {
                    Ok(()) => {
                        reporter.report(BatchEvent::ItemSucceeded {
                            target: &target,
                            attempts: executed.attempts,
                        });
                        ItemOutcome::Succeeded
                    }
                    Err(e) => self.failed(target, &e, reporter),
                }
            }
            Err(e) if e.is_retry_later() => self.enqueue(item, &e, reporter).await,
            Err(e) => self.failed(item.target, &e, reporter),
        }
    }

    async fn enqueue<R: BatchReporter>(
        &self,
        item: BatchItem,
        error: &AppError,
        reporter: &R,
    ) -> ItemOutcome {
        let error_message = error.to_string();
        let mut task = FailedTask::new(
            &self.task_type,
            &item.target,
            &error_message,
            self.max_task_retries,
        );
        match serde_json::to_value(&item.request) {
            Ok(request) => {
                task.metadata.insert(REQUEST_METADATA_KEY.to_string(), request);
            }
            Err(e) => tracing::warn!(target = %item.target, error = %e, "Could not serialize request"),
        }
        if let Ok(attempts) = serde_json::to_value(error.attempts()) {
            task.metadata.insert(ATTEMPTS_METADATA_KEY.to_string(), attempts);
        }

        match self.queue.add(task).await {
            Ok(task) => {
                reporter.report(BatchEvent::ItemQueued {
                    target: &item.target,
                    task_id: &task.task_id,
                    error: &error_message,
                });
                ItemOutcome::Queued
            }
            Err(e) => {
                tracing::error!(target = %item.target, error = %e, "Failed to queue task");
                self.failed(item.target, &e, reporter)
            }
        }
    }

    fn failed<R: BatchReporter>(&self, target: String, error: &AppError, reporter: &R) -> ItemOutcome {
        let error = error.to_string();
        reporter.report(BatchEvent::ItemFailed {
            target: &target,
            error: &error,
        });
        ItemOutcome::Failed(BatchFailure { target, error })
    }
}

/// The request a queued task was created from, or a GET of its target.
pub fn request_for(task: &FailedTask) -> OutboundRequest {
    task.metadata
        .get(REQUEST_METADATA_KEY)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_else(|| OutboundRequest::get(&task.target))
}
