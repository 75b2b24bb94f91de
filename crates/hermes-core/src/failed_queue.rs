//! Durable queue of failed work items with scheduled out-of-band retries.
//!
//! Work that exhausted its local retries (or was rejected by an open circuit)
//! is parked here and retried later by a registered [`TaskHandler`]:
//!
//! ```text
//! add ──> pending ──[due, handler ok]──> removed
//!            │  ^
//!            │  └──[handler err, retry_count < max]── next_retry_time = now + backoff(retry_count)
//!            └──────[retry_count == max]──────────────> dead letters
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::compute_hash;
use crate::retry::Backoff;
use crate::traits::FailedTaskStore;

/// A unit of work that failed and awaits an out-of-band retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: String,
    pub task_type: String,
    /// What to retry: a URL, page number, item id…
    pub target: String,
    pub error_message: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl FailedTask {
    /// New task, due immediately until a queue schedules it.
    pub fn new(
        task_type: impl Into<String>,
        target: impl Into<String>,
        error_message: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        let task_type = task_type.into();
        let target = target.into();
        let now = Utc::now();
        Self {
            task_id: Self::derive_id(&task_type, &target),
            task_type,
            target,
            error_message: error_message.into(),
            retry_count: 0,
            max_retries,
            next_retry_time: now,
            created_at: now,
            metadata: serde_json::Map::new(),
        }
    }

    /// `{task_type}_{first 8 hex chars of sha256(target)}`.
    pub fn derive_id(task_type: &str, target: &str) -> String {
        format!("{}_{}", task_type, &compute_hash(target)[..8])
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_next_retry_time(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_time = at;
        self
    }

    /// No retries left.
    pub fn is_terminal(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_time <= now
    }
}

/// Retries one failed task. `Ok` removes it from the queue.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, task: FailedTask) -> BoxFuture<'static, Result<(), AppError>>;
}

impl<F, Fut> TaskHandler for F
where
    F: Fn(FailedTask) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AppError>> + Send + 'static,
{
    fn handle(&self, task: FailedTask) -> BoxFuture<'static, Result<(), AppError>> {
        self(task).boxed()
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    /// Out-of-band retry schedule; `delay_for(0)` is the first retry.
    pub backoff: Backoff,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            poll_interval: Duration::from_secs(30),
            backoff: Backoff {
                base_delay: Duration::from_secs(300),
                max_delay: Duration::from_secs(3600),
                factor: 2.0,
                jitter: false,
            },
        }
    }
}

impl QueueConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// What one `poll_once` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub dispatched: usize,
    pub recovered: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Outcomes that could not be persisted; those tasks stay as they were.
    pub persistence_errors: usize,
}

enum Settled {
    Recovered,
    Rescheduled,
    DeadLettered,
    /// Removed from the queue while its retry was running.
    Removed,
}

/// Removes a task id from the in-flight set when dropped.
struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut ids = self.ids.lock().unwrap_or_else(|p| p.into_inner());
        ids.remove(&self.task_id);
    }
}

/// Durable failed-task queue with a polling retry scheduler.
#[derive(Clone)]
pub struct FailedTaskQueue<S> {
    store: S,
    config: QueueConfig,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn TaskHandler>>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    /// Serializes read-modify-write cycles on stored tasks.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<S: FailedTaskStore> FailedTaskQueue<S> {
    pub fn new(store: S, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register the retry handler for a task type, replacing any previous one.
    pub fn register_handler(&self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) {
        let mut handlers = self.handlers.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned handler table");
            poisoned.into_inner()
        });
        handlers.insert(task_type.into(), Arc::new(handler));
    }

    fn handler_for(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        handlers.get(task_type).cloned()
    }

    fn claim(&self, task_id: &str) -> Option<InFlight> {
        let mut ids = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        ids.insert(task_id.to_string()).then(|| InFlight {
            ids: self.in_flight.clone(),
            task_id: task_id.to_string(),
        })
    }

    /// Queue a failed task.
    ///
    /// A task with the same id already pending keeps its retry count and
    /// schedule; only its error message and metadata are updated. A new task
    /// is first due after `backoff.delay_for(retry_count)`.
    pub async fn add(&self, task: FailedTask) -> Result<FailedTask, AppError> {
        let _guard = self.write_lock.lock().await;

        if let Some(mut existing) = self.store.get_task(&task.task_id).await? {
            existing.error_message = task.error_message;
            existing.metadata.extend(task.metadata);
            self.store.upsert_task(&existing).await?;
            tracing::info!(
                task_id = %existing.task_id,
                retry_count = existing.retry_count,
                "Updated pending failed task"
            );
            return Ok(existing);
        }

        let mut task = task;
        let earliest = after(self.config.backoff.delay_for(task.retry_count));
        task.next_retry_time = task.next_retry_time.max(earliest);
        self.store.upsert_task(&task).await?;
        tracing::info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            target = %task.target,
            next_retry_time = %task.next_retry_time,
            "Failed task queued"
        );
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<FailedTask>, AppError> {
        self.store.get_task(task_id).await
    }

    pub async fn pending(&self) -> Result<Vec<FailedTask>, AppError> {
        self.store.list_pending().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<FailedTask>, AppError> {
        self.store.list_dead_letters().await
    }

    /// Drop a pending task without retrying it.
    pub async fn remove(&self, task_id: &str) -> Result<bool, AppError> {
        let _guard = self.write_lock.lock().await;
        self.store.remove_task(task_id).await
    }

    /// One scheduler pass: sweep terminal tasks, then run everything due.
    pub async fn poll_once(&self) -> Result<PollSummary, AppError> {
        let mut summary = PollSummary::default();
        let now = Utc::now();
        let mut due = Vec::new();

        for task in self.store.list_pending().await? {
            if task.is_terminal() {
                let Some(claim) = self.claim(&task.task_id) else {
                    continue;
                };
                let _guard = self.write_lock.lock().await;
                match self.store.dead_letter(&task).await {
                    Ok(()) => {
                        tracing::warn!(
                            task_id = %task.task_id,
                            retry_count = task.retry_count,
                            "Terminal failed task moved to dead letters"
                        );
                        summary.dead_lettered += 1;
                    }
                    Err(e) => {
                        tracing::error!(task_id = %task.task_id, error = %e, "Failed to dead-letter task");
                        summary.persistence_errors += 1;
                    }
                }
                drop(claim);
                continue;
            }

            if !task.is_due(now) {
                continue;
            }
            let Some(handler) = self.handler_for(&task.task_type) else {
                continue;
            };
            let Some(claim) = self.claim(&task.task_id) else {
                continue;
            };
            due.push((task, handler, claim));
        }

        summary.dispatched = due.len();
        if due.is_empty() {
            return Ok(summary);
        }
        tracing::info!(count = due.len(), "Retrying failed tasks");

        let retries: Vec<_> = due
            .into_iter()
            .map(|(task, handler, claim)| self.retry_one(task, handler, claim).boxed())
            .collect();
        let results: Vec<Result<Settled, AppError>> = futures::stream::iter(retries)
            .buffer_unordered(self.config.max_workers.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                Ok(Settled::Recovered) => summary.recovered += 1,
                Ok(Settled::Rescheduled) => summary.rescheduled += 1,
                Ok(Settled::DeadLettered) => summary.dead_lettered += 1,
                Ok(Settled::Removed) => {}
                Err(_) => summary.persistence_errors += 1,
            }
        }
        Ok(summary)
    }

    async fn retry_one(
        &self,
        task: FailedTask,
        handler: Arc<dyn TaskHandler>,
        claim: InFlight,
    ) -> Result<Settled, AppError> {
        tracing::debug!(task_id = %task.task_id, attempt = task.retry_count + 1, "Retrying failed task");
        let outcome = handler.handle(task.clone()).await;
        let settled = self.settle(task, outcome).await;
        drop(claim);
        settled
    }

    async fn settle(
        &self,
        task: FailedTask,
        outcome: Result<(), AppError>,
    ) -> Result<Settled, AppError> {
        let _guard = self.write_lock.lock().await;
        let task_id = task.task_id.clone();

        let result = match outcome {
            Ok(()) => self.store.remove_task(&task_id).await.map(|_| {
                tracing::info!(%task_id, "Failed task recovered");
                Settled::Recovered
            }),
            Err(error) => {
                let Some(mut current) = self.store.get_task(&task_id).await? else {
                    tracing::info!(%task_id, error = %error, "Failed task removed during its retry, not rescheduled");
                    return Ok(Settled::Removed);
                };
                let delay = self.config.backoff.delay_for(current.retry_count);
                current.retry_count += 1;
                current.error_message = error.to_string();

                if current.is_terminal() {
                    self.store.dead_letter(&current).await.map(|()| {
                        tracing::warn!(
                            %task_id,
                            retry_count = current.retry_count,
                            error = %error,
                            "Failed task exhausted its retries, moved to dead letters"
                        );
                        Settled::DeadLettered
                    })
                } else {
                    current.next_retry_time = after(delay);
                    self.store.upsert_task(&current).await.map(|()| {
                        tracing::info!(
                            %task_id,
                            retry_count = current.retry_count,
                            next_retry_time = %current.next_retry_time,
                            error = %error,
                            "Failed task retry failed, rescheduled"
                        );
                        Settled::Rescheduled
                    })
                }
            }
        };

        result.inspect_err(|e| {
            tracing::error!(%task_id, error = %e, "Failed to persist retry outcome");
        })
    }

    /// Poll every `poll_interval` until cancelled.
    pub async fn run(&self, cancel_token: CancellationToken) {
        tracing::info!(
            max_workers = self.config.max_workers,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Failed task scheduler started"
        );

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                Ok(summary) if summary.dispatched > 0 || summary.dead_lettered > 0 => {
                    tracing::info!(
                        dispatched = summary.dispatched,
                        recovered = summary.recovered,
                        rescheduled = summary.rescheduled,
                        dead_lettered = summary.dead_lettered,
                        "Failed task poll finished"
                    );
                }
                Ok(_) => tracing::debug!("No failed tasks due"),
                Err(e) => tracing::error!(error = %e, "Failed to poll failed tasks"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                () = cancel_token.cancelled() => break,
            }
        }

        tracing::info!("Failed task scheduler stopped");
    }
}

/// `now + d`, saturating at the latest representable time.
fn after(d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testutil::MemoryStore;

    fn immediate() -> QueueConfig {
        QueueConfig::default().with_backoff(Backoff {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 2.0,
            jitter: false,
        })
    }

    fn due(task_type: &str, target: &str, max_retries: u32) -> FailedTask {
        FailedTask::new(task_type, target, "HTTP 503", max_retries)
            .with_next_retry_time(Utc::now() - TimeDelta::seconds(1))
    }

    #[test]
    fn task_id_is_derived_from_type_and_target() {
        let a = FailedTask::new("listings", "https://example.com/p/1", "err", 3);
        let b = FailedTask::new("listings", "https://example.com/p/1", "other", 3);
        let c = FailedTask::new("listings", "https://example.com/p/2", "err", 3);

        assert_eq!(a.task_id, b.task_id);
        assert_ne!(a.task_id, c.task_id);
        assert!(a.task_id.starts_with("listings_"));
        assert_eq!(a.task_id.len(), "listings_".len() + 8);
    }

    #[tokio::test]
    async fn add_schedules_first_retry_after_base_delay() {
        let queue = FailedTaskQueue::new(MemoryStore::new(), QueueConfig::default());
        let before = Utc::now();

        let task = queue
            .add(FailedTask::new("listings", "page-3", "HTTP 503", 3))
            .await
            .unwrap();

        assert!(task.next_retry_time >= before + TimeDelta::seconds(300));
        assert!(task.next_retry_time <= Utc::now() + TimeDelta::seconds(300));
    }

    #[tokio::test]
    async fn re_adding_keeps_retry_count() {
        let store = MemoryStore::new();
        let queue = FailedTaskQueue::new(store.clone(), QueueConfig::default());

        let mut stored = FailedTask::new("listings", "page-3", "HTTP 503", 3);
        stored.retry_count = 2;
        store.upsert_task(&stored).await.unwrap();

        let updated = queue
            .add(
                FailedTask::new("listings", "page-3", "HTTP 502", 3)
                    .with_metadata("attempts", serde_json::json!(4)),
            )
            .await
            .unwrap();

        assert_eq!(updated.retry_count, 2);
        assert_eq!(updated.error_message, "HTTP 502");
        assert_eq!(updated.metadata["attempts"], 4);
        assert_eq!(queue.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn successful_retry_removes_task() {
        let store = MemoryStore::new();
        let queue = FailedTaskQueue::new(store.clone(), QueueConfig::default());
        queue.register_handler("listings", |_task: FailedTask| async { Ok::<_, AppError>(()) });
        store.upsert_task(&due("listings", "page-3", 3)).await.unwrap();

        let summary = queue.poll_once().await.unwrap();

        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.recovered, 1);
        assert!(queue.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_retry_is_rescheduled_with_backoff() {
        let store = MemoryStore::new();
        let queue = FailedTaskQueue::new(store.clone(), QueueConfig::default());
        queue.register_handler("listings", |_task: FailedTask| async {
            Err::<(), _>(AppError::HandlerError("still down".into()))
        });
        let task = due("listings", "page-3", 3);
        store.upsert_task(&task).await.unwrap();

        let before = Utc::now();
        let summary = queue.poll_once().await.unwrap();
        assert_eq!(summary.rescheduled, 1);

        let stored = queue.get(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert!(stored.error_message.contains("still down"));
        // first failure waits delay_for(0) = 300s
        assert!(stored.next_retry_time >= before + TimeDelta::seconds(300));
        assert!(stored.next_retry_time <= Utc::now() + TimeDelta::seconds(300));

        let summary = queue.poll_once().await.unwrap();
        assert_eq!(summary.dispatched, 0);
    }

    #[tokio::test]
    async fn backoff_doubles_from_base_delay_per_failure() {
        let store = MemoryStore::new();
        let queue = FailedTaskQueue::new(store.clone(), QueueConfig::default());
        queue.register_handler("listings", |_task: FailedTask| async {
            Err::<(), _>(AppError::HandlerError("still down".into()))
        });
        let mut task = due("listings", "page-3", 5);
        task.retry_count = 2;
        store.upsert_task(&task).await.unwrap();

        let before = Utc::now();
        queue.poll_once().await.unwrap();

        let stored = queue.get(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 3);
        // third failure waits delay_for(2) = 1200s
        assert!(stored.next_retry_time >= before + TimeDelta::seconds(1200));
        assert!(stored.next_retry_time <= Utc::now() + TimeDelta::seconds(1200));
    }

    #[tokio::test]
    async fn task_removed_during_retry_is_not_brought_back() {
        let store = MemoryStore::new();
        let queue = FailedTaskQueue::new(store.clone(), immediate());
        let task = due("listings", "page-4", 3);
        store.upsert_task(&task).await.unwrap();

        let remover = store.clone();
        queue.register_handler("listings", move |task: FailedTask| {
            let remover = remover.clone();
            async move {
                remover.remove_task(&task.task_id).await?;
                Err::<(), _>(AppError::HandlerError("down".into()))
            }
        });

        let summary = queue.poll_once().await.unwrap();

        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.rescheduled, 0);
        assert_eq!(summary.persistence_errors, 0);
        assert!(queue.get(&task.task_id).await.unwrap().is_none());
        assert!(queue.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_task_goes_to_dead_letters_and_is_never_redispatched() {
        let queue = FailedTaskQueue::new(MemoryStore::new(), immediate());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        queue.register_handler("listings", move |_task: FailedTask| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AppError::HandlerError("nope".into())) }
        });
        queue
            .add(FailedTask::new("listings", "page-3", "HTTP 503", 2))
            .await
            .unwrap();

        for _ in 0..5 {
            queue.poll_once().await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(queue.pending().await.unwrap().is_empty());
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 2);
    }

    #[tokio::test]
    async fn terminal_tasks_are_swept_without_dispatch() {
        let store = MemoryStore::new();
        let queue = FailedTaskQueue::new(store.clone(), immediate());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        queue.register_handler("listings", move |_task: FailedTask| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, AppError>(()) }
        });

        let mut task = due("listings", "page-9", 3);
        task.retry_count = 3;
        store.upsert_task(&task).await.unwrap();

        let summary = queue.poll_once().await.unwrap();
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(summary.dispatched, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tasks_without_handler_are_left_alone() {
        let store = MemoryStore::new();
        let queue = FailedTaskQueue::new(store.clone(), immediate());
        store.upsert_task(&due("details", "item-1", 3)).await.unwrap();

        let summary = queue.poll_once().await.unwrap();
        assert_eq!(summary, PollSummary::default());
        assert_eq!(queue.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_respects_max_workers() {
        let store = MemoryStore::new();
        let queue = FailedTaskQueue::new(store.clone(), immediate().with_max_workers(2));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let current = current.clone();
            let peak = peak.clone();
            queue.register_handler("listings", move |_task: FailedTask| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, AppError>(())
                }
            });
        }
        for i in 0..6 {
            store.upsert_task(&due("listings", &format!("page-{i}"), 3)).await.unwrap();
        }

        let summary = queue.poll_once().await.unwrap();
        assert_eq!(summary.recovered, 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn in_flight_task_is_not_dispatched_twice() {
        let store = MemoryStore::new();
        let queue = FailedTaskQueue::new(store.clone(), immediate());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        queue.register_handler("listings", move |_task: FailedTask| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, AppError>(())
            }
        });
        store.upsert_task(&due("listings", "page-1", 3)).await.unwrap();

        let (a, b) = tokio::join!(queue.poll_once(), queue.poll_once());
        assert_eq!(a.unwrap().dispatched + b.unwrap().dispatched, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistence_failure_leaves_task_untouched() {
        let store = MemoryStore::new();
        let queue = FailedTaskQueue::new(store.clone(), immediate());
        let task = due("listings", "page-1", 3);
        store.upsert_task(&task).await.unwrap();

        let failing = store.clone();
        queue.register_handler("listings", move |_task: FailedTask| {
            failing.fail_writes(true);
            async { Err::<(), _>(AppError::HandlerError("down".into())) }
        });

        let summary = queue.poll_once().await.unwrap();
        assert_eq!(summary.persistence_errors, 1);

        store.fail_writes(false);
        let stored = queue.get(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored, task);
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_until_cancelled() {
        let store = MemoryStore::new();
        let queue = FailedTaskQueue::new(
            store.clone(),
            immediate().with_poll_interval(Duration::from_secs(1)),
        );
        queue.register_handler("listings", |_task: FailedTask| async { Ok::<_, AppError>(()) });

        let cancel = CancellationToken::new();
        let handle = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.run(cancel).await })
        };

        store.upsert_task(&due("listings", "page-1", 3)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(queue.pending().await.unwrap().is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
