use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::traits::RunStore;

/// Status of one collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

/// Bookkeeping for one pass of a collection task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRun {
    pub run_id: Uuid,
    pub task_type: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub pages: u64,
    pub items: u64,
    pub failures: u64,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl CollectionRun {
    pub fn start(task_type: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            task_type: task_type.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            pages: 0,
            items: 0,
            failures: 0,
            error_message: None,
        }
    }

    /// Count one finished page and the items it produced.
    pub fn record_page(&mut self, items: u64) {
        self.pages += 1;
        self.items += items;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    fn close(&mut self, status: RunStatus, error_message: Option<String>) {
        self.status = status;
        self.ended_at = Some(Utc::now());
        self.error_message = error_message;
    }
}

/// Starts, updates and closes [`CollectionRun`]s in a [`RunStore`].
#[derive(Clone)]
pub struct RunTracker<S> {
    store: S,
}

impl<S: RunStore> RunTracker<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn start(&self, task_type: &str) -> Result<CollectionRun, AppError> {
        let run = CollectionRun::start(task_type);
        self.store.put_run(&run).await?;
        tracing::info!(run_id = %run.run_id, task_type, "Collection run started");
        Ok(run)
    }

    /// Persist the run's counters.
    pub async fn update(&self, run: &CollectionRun) -> Result<(), AppError> {
        self.store.put_run(run).await
    }

    pub async fn finish(
        &self,
        mut run: CollectionRun,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<CollectionRun, AppError> {
        run.close(status, error_message);
        self.store.put_run(&run).await?;
        tracing::info!(
            run_id = %run.run_id,
            task_type = %run.task_type,
            status = %run.status,
            pages = run.pages,
            items = run.items,
            failures = run.failures,
            "Collection run finished"
        );
        Ok(run)
    }

    pub async fn list(&self, status: Option<RunStatus>) -> Result<Vec<CollectionRun>, AppError> {
        self.store.list_runs(status).await
    }

    /// Close runs of the given task types that are still marked running.
    ///
    /// Meant for process start, when nothing of this deployment can still
    /// be running them.
    pub async fn close_crashed(&self, task_types: &[&str]) -> Result<Vec<CollectionRun>, AppError> {
        let mut closed = Vec::new();
        for run in self.store.list_runs(Some(RunStatus::Running)).await? {
            if !task_types.contains(&run.task_type.as_str()) {
                continue;
            }
            let run = self
                .finish(
                    run,
                    RunStatus::Failed,
                    Some("process exited while the run was in progress".to_string()),
                )
                .await?;
            tracing::warn!(run_id = %run.run_id, task_type = %run.task_type, "Closed crashed run");
            closed.push(run);
        }
        Ok(closed)
    }
}
