//! Startup reconciliation of resume points, failed tasks and runs.
//!
//! [`ResumeCoordinator::recover`] runs once at process start. It reports
//! where each task type resumes and everything that looks inconsistent
//! between the progress records and the external data store. It only
//! reports: no item or failed task is modified. The one write it performs is
//! closing runs a crashed process left marked as running.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::checkpoint::ResumePoint;
use crate::error::AppError;
use crate::failed_queue::FailedTask;
use crate::runs::RunTracker;
use crate::traits::{CheckpointStore, FailedTaskStore, ItemLedger, RunStore};

/// Resume points older than this are reported as stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Why a pending failed task looks orphaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    /// The external store already holds the target.
    AlreadyStored,
    /// Its task type has never checkpointed.
    NoResumePoint,
}

/// One inconsistency found during recovery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    /// Fewer items stored than the resume point claims.
    MissingItems {
        task_type: String,
        expected: u64,
        observed: u64,
    },
    /// More items stored than the resume point accounts for.
    UntrackedItems {
        task_type: String,
        expected: u64,
        observed: u64,
    },
    DuplicateItems {
        task_type: String,
        keys: Vec<String>,
    },
    OrphanedFailedTask {
        task_type: String,
        task_id: String,
        target: String,
        reason: OrphanReason,
    },
    OverRetriedTask {
        task_type: String,
        task_id: String,
        retry_count: u32,
        max_retries: u32,
    },
    StaleResumePoint {
        task_type: String,
        last_update: DateTime<Utc>,
        age_hours: i64,
    },
    CrashedRun {
        task_type: String,
        run_id: Uuid,
    },
}

impl Finding {
    pub fn task_type(&self) -> &str {
        match self {
            Finding::MissingItems { task_type, .. }
            | Finding::UntrackedItems { task_type, .. }
            | Finding::DuplicateItems { task_type, .. }
            | Finding::OrphanedFailedTask { task_type, .. }
            | Finding::OverRetriedTask { task_type, .. }
            | Finding::StaleResumePoint { task_type, .. }
            | Finding::CrashedRun { task_type, .. } => task_type,
        }
    }
}

/// Where one task type picks up again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecovery {
    pub task_type: String,
    pub resume_point: Option<ResumePoint>,
    pub next_page: u64,
    pub pending_failed: usize,
    pub dead_letters: usize,
}

/// Result of [`ResumeCoordinator::recover`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub checked_at: DateTime<Utc>,
    pub tasks: Vec<TaskRecovery>,
    pub findings: Vec<Finding>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn task(&self, task_type: &str) -> Option<&TaskRecovery> {
        self.tasks.iter().find(|t| t.task_type == task_type)
    }

    pub fn findings_for<'a>(&'a self, task_type: &'a str) -> impl Iterator<Item = &'a Finding> + 'a {
        self.findings.iter().filter(move |f| f.task_type() == task_type)
    }
}

/// Cross-checks durable progress against the external data store at startup.
#[derive(Clone)]
pub struct ResumeCoordinator<C, F, R, L> {
    checkpoints: C,
    failed: F,
    runs: R,
    ledger: L,
    stale_after: Duration,
}

impl<C, F, R, L> ResumeCoordinator<C, F, R, L>
where
    C: CheckpointStore,
    F: FailedTaskStore,
    R: RunStore,
    L: ItemLedger,
{
    pub fn new(checkpoints: C, failed: F, runs: R, ledger: L) -> Self {
        Self {
            checkpoints,
            failed,
            runs,
            ledger,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub async fn recover(&self, task_types: &[&str]) -> Result<IntegrityReport, AppError> {
        let now = Utc::now();
        let mut findings = Vec::new();
        let mut tasks = Vec::new();

        let closed = RunTracker::new(self.runs.clone())
            .close_crashed(task_types)
            .await?;
        findings.extend(closed.into_iter().map(|run| Finding::CrashedRun {
            task_type: run.task_type,
            run_id: run.run_id,
        }));

        let pending = self.failed.list_pending().await?;
        let dead = self.failed.list_dead_letters().await?;

        for &task_type in task_types {
            let point = self.checkpoints.load_checkpoint(task_type).await?;
            let pending_of_type: Vec<&FailedTask> =
                pending.iter().filter(|t| t.task_type == task_type).collect();
            let dead_of_type: Vec<&FailedTask> =
                dead.iter().filter(|t| t.task_type == task_type).collect();

            if let Some(point) = &point {
                self.check_staleness(point, now, &mut findings);
            }
            self.check_counts(task_type, point.as_ref(), &mut findings)
                .await?;

            for task in pending_of_type.iter().chain(dead_of_type.iter()) {
                if task.retry_count > task.max_retries {
                    findings.push(Finding::OverRetriedTask {
                        task_type: task_type.to_string(),
                        task_id: task.task_id.clone(),
                        retry_count: task.retry_count,
                        max_retries: task.max_retries,
                    });
                }
            }

            for task in &pending_of_type {
                let reason = if point.is_none() {
                    Some(OrphanReason::NoResumePoint)
                } else if self.ledger.contains(task_type, &task.target).await? {
                    Some(OrphanReason::AlreadyStored)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    findings.push(Finding::OrphanedFailedTask {
                        task_type: task_type.to_string(),
                        task_id: task.task_id.clone(),
                        target: task.target.clone(),
                        reason,
                    });
                }
            }

            let next_page = point.as_ref().map_or(1, ResumePoint::next_page);
            tracing::info!(
                task_type,
                next_page,
                pending_failed = pending_of_type.len(),
                dead_letters = dead_of_type.len(),
                "Resume state loaded"
            );
            tasks.push(TaskRecovery {
                task_type: task_type.to_string(),
                resume_point: point,
                next_page,
                pending_failed: pending_of_type.len(),
                dead_letters: dead_of_type.len(),
            });
        }

        for finding in &findings {
            tracing::warn!(task_type = %finding.task_type(), ?finding, "Integrity finding");
        }
        if findings.is_empty() {
            tracing::info!(task_types = task_types.len(), "Integrity check clean");
        }

        Ok(IntegrityReport {
            checked_at: now,
            tasks,
            findings,
        })
    }

    fn check_staleness(&self, point: &ResumePoint, now: DateTime<Utc>, findings: &mut Vec<Finding>) {
        let stale_after = TimeDelta::from_std(self.stale_after).unwrap_or(TimeDelta::MAX);
        let age = now.signed_duration_since(point.last_update);
        if age > stale_after {
            findings.push(Finding::StaleResumePoint {
                task_type: point.task_type.clone(),
                last_update: point.last_update,
                age_hours: age.num_hours(),
            });
        }
    }

    async fn check_counts(
        &self,
        task_type: &str,
        point: Option<&ResumePoint>,
        findings: &mut Vec<Finding>,
    ) -> Result<(), AppError> {
        if let Some(observed) = self.ledger.count(task_type).await? {
            let expected = point.map_or(0, |p| p.total_processed);
            if observed < expected {
                findings.push(Finding::MissingItems {
                    task_type: task_type.to_string(),
                    expected,
                    observed,
                });
            } else if observed > expected {
                findings.push(Finding::UntrackedItems {
                    task_type: task_type.to_string(),
                    expected,
                    observed,
                });
            }
        }

        let keys = self.ledger.duplicates(task_type).await?;
        if !keys.is_empty() {
            findings.push(Finding::DuplicateItems {
                task_type: task_type.to_string(),
                keys,
            });
        }
        Ok(())
    }
}
