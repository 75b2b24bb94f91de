//! Durable resume points, one per task type.
//!
//! A resume point records how far a collection task has durably got. Callers
//! update it after each unit of work has been stored, so after a crash the
//! task restarts at [`ResumePoint::next_page`] and at most the last unit is
//! repeated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::traits::CheckpointStore;

/// Latest durable progress of one task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub task_type: String,
    /// Last page fully processed; 0 before the first page.
    pub current_page: u64,
    #[serde(default)]
    pub last_cursor: Option<String>,
    /// Identifier of the last item seen.
    #[serde(default)]
    pub last_item: Option<String>,
    pub total_processed: u64,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ResumePoint {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            current_page: 0,
            last_cursor: None,
            last_item: None,
            total_processed: 0,
            last_update: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Page to fetch when resuming.
    pub fn next_page(&self) -> u64 {
        self.current_page + 1
    }

    /// Equal in everything but `last_update`.
    pub fn same_progress(&self, other: &ResumePoint) -> bool {
        self.task_type == other.task_type
            && self.current_page == other.current_page
            && self.last_cursor == other.last_cursor
            && self.last_item == other.last_item
            && self.total_processed == other.total_processed
            && self.metadata == other.metadata
    }
}

/// Partial update merged into the stored point. Unset fields keep their value;
/// metadata keys are merged, overwriting on conflict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumeUpdate {
    pub current_page: Option<u64>,
    pub last_cursor: Option<String>,
    pub last_item: Option<String>,
    pub total_processed: Option<u64>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ResumeUpdate {
    pub fn page(page: u64) -> Self {
        Self {
            current_page: Some(page),
            ..Self::default()
        }
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.last_cursor = Some(cursor.into());
        self
    }

    pub fn with_last_item(mut self, item: impl Into<String>) -> Self {
        self.last_item = Some(item.into());
        self
    }

    pub fn with_total_processed(mut self, total: u64) -> Self {
        self.total_processed = Some(total);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    fn apply(self, point: &mut ResumePoint) {
        if let Some(page) = self.current_page {
            point.current_page = page;
        }
        if let Some(cursor) = self.last_cursor {
            point.last_cursor = Some(cursor);
        }
        if let Some(item) = self.last_item {
            point.last_item = Some(item);
        }
        if let Some(total) = self.total_processed {
            point.total_processed = total;
        }
        point.metadata.extend(self.metadata);
    }
}

/// Serializes read-merge-write cycles per task type over a [`CheckpointStore`].
#[derive(Clone)]
pub struct Checkpointer<S> {
    store: S,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl<S: CheckpointStore> Checkpointer<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn key_lock(&self, task_type: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned checkpoint lock table");
            poisoned.into_inner()
        });
        locks.entry(task_type.to_string()).or_default().clone()
    }

    /// Merge `update` into the stored point for `task_type` and persist it.
    ///
    /// Returns the stored point. An update that changes nothing is not
    /// written and returns the existing point as-is.
    pub async fn create_or_update(
        &self,
        task_type: &str,
        update: ResumeUpdate,
    ) -> Result<ResumePoint, AppError> {
        let lock = self.key_lock(task_type);
        let _guard = lock.lock().await;

        let existing = self.store.load_checkpoint(task_type).await?;
        let mut point = existing
            .clone()
            .unwrap_or_else(|| ResumePoint::new(task_type));
        update.apply(&mut point);

        if let Some(previous) = existing
            && previous.same_progress(&point)
        {
            tracing::debug!(task_type, "Resume point unchanged, skipping write");
            return Ok(previous);
        }

        point.last_update = Utc::now();
        if let Err(e) = self.store.save_checkpoint(&point).await {
            tracing::error!(task_type, error = %e, "Failed to persist resume point");
            return Err(e);
        }

        tracing::debug!(
            task_type,
            page = point.current_page,
            total_processed = point.total_processed,
            "Resume point saved"
        );
        Ok(point)
    }

    pub async fn get(&self, task_type: &str) -> Result<Option<ResumePoint>, AppError> {
        self.store.load_checkpoint(task_type).await
    }

    pub async fn list(&self) -> Result<Vec<ResumePoint>, AppError> {
        self.store.list_checkpoints().await
    }
}
