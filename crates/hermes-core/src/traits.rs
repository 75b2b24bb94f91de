use std::future::Future;

use uuid::Uuid;

use crate::checkpoint::ResumePoint;
use crate::error::AppError;
use crate::failed_queue::FailedTask;
use crate::models::{HttpResponse, OutboundRequest, Route};
use crate::runs::{CollectionRun, RunStatus};

/// Performs one network call.
///
/// Implementations return every HTTP status as `Ok`; only failures to get a
/// response at all (connect, timeout, protocol) are errors.
pub trait Transport: Send + Sync + Clone {
    fn send(
        &self,
        request: &OutboundRequest,
        route: &Route,
    ) -> impl Future<Output = Result<HttpResponse, AppError>> + Send;
}

/// Durable latest [`ResumePoint`] per task type.
pub trait CheckpointStore: Send + Sync + Clone {
    fn load_checkpoint(
        &self,
        task_type: &str,
    ) -> impl Future<Output = Result<Option<ResumePoint>, AppError>> + Send;

    /// Replace the stored point for `point.task_type` in one atomic write.
    fn save_checkpoint(&self, point: &ResumePoint) -> impl Future<Output = Result<(), AppError>> + Send;

    fn list_checkpoints(&self) -> impl Future<Output = Result<Vec<ResumePoint>, AppError>> + Send;
}

/// Durable pending failed tasks and their dead letters.
pub trait FailedTaskStore: Send + Sync + Clone {
    fn get_task(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<Option<FailedTask>, AppError>> + Send;

    /// Insert or replace a pending task.
    fn upsert_task(&self, task: &FailedTask) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Remove a pending task. Returns false if it was not there.
    fn remove_task(&self, task_id: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn list_pending(&self) -> impl Future<Output = Result<Vec<FailedTask>, AppError>> + Send;

    /// Move a task from the pending collection to the dead letters.
    fn dead_letter(&self, task: &FailedTask) -> impl Future<Output = Result<(), AppError>> + Send;

    fn list_dead_letters(
        &self,
    ) -> impl Future<Output = Result<Vec<FailedTask>, AppError>> + Send;
}

/// Durable collection-run bookkeeping.
pub trait RunStore: Send + Sync + Clone {
    fn put_run(&self, run: &CollectionRun) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_run(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<Option<CollectionRun>, AppError>> + Send;

    /// All runs, or only those in `status`.
    fn list_runs(
        &self,
        status: Option<RunStatus>,
    ) -> impl Future<Output = Result<Vec<CollectionRun>, AppError>> + Send;
}

/// Read-only view of the external data store the collected items end up in.
pub trait ItemLedger: Send + Sync + Clone {
    /// Number of stored items for a task type, or `None` when not observable.
    fn count(
        &self,
        task_type: &str,
    ) -> impl Future<Output = Result<Option<u64>, AppError>> + Send;

    /// Natural keys stored more than once.
    fn duplicates(
        &self,
        task_type: &str,
    ) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;

    /// Whether the item a failed task targets has been stored after all.
    fn contains(
        &self,
        task_type: &str,
        target: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// An ItemLedger for when no external store is observable.
#[derive(Debug, Clone)]
pub struct NullLedger;

impl ItemLedger for NullLedger {
    async fn count(&self, _task_type: &str) -> Result<Option<u64>, AppError> {
        Ok(None)
    }

    async fn duplicates(&self, _task_type: &str) -> Result<Vec<String>, AppError> {
        Ok(vec![])
    }

    async fn contains(&self, _task_type: &str, _target: &str) -> Result<bool, AppError> {
        Ok(false)
    }
}
