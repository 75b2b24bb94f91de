//! JSON-file backend for checkpoints, failed tasks, dead letters and runs.
//!
//! Layout: one directory per collection, one `<key>.json` file per record.
//!
//! ```text
//! <root>/checkpoints/<task_type>.json
//! <root>/failed_tasks/<task_id>.json
//! <root>/dead_letters/<task_id>.json
//! <root>/runs/<run_id>.json
//! ```
//!
//! Every write goes to a temporary file next to the record, is fsynced, then
//! renamed over it, so a reader sees either the old or the new record. The
//! collection directory is fsynced after the rename so the rename itself is
//! durable. A crash
//! mid-write can leave `*.tmp` files behind; they are never read.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::checkpoint::ResumePoint;
use crate::error::AppError;
use crate::failed_queue::FailedTask;
use crate::models::compute_hash;
use crate::runs::{CollectionRun, RunStatus};
use crate::traits::{CheckpointStore, FailedTaskStore, RunStore};

const CHECKPOINTS: &str = "checkpoints";
const FAILED_TASKS: &str = "failed_tasks";
const DEAD_LETTERS: &str = "dead_letters";
const RUNS: &str = "runs";

/// Directory-per-collection JSON store.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

fn io_error(path: &Path, e: std::io::Error) -> AppError {
    AppError::PersistenceError(format!("{}: {e}", path.display()))
}

/// File stem for a key: the key itself when it is filesystem-safe, its hash otherwise.
/// fsync a directory so renames inside it survive a power loss.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn file_stem(key: &str) -> String {
    let safe = !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        key.to_string()
    } else {
        compute_hash(key)
    }
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, AppError> {
        let root = root.into();
        for collection in [CHECKPOINTS, FAILED_TASKS, DEAD_LETTERS, RUNS] {
            let dir = root.join(collection);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| io_error(&dir, e))?;
        }
        tracing::debug!(root = %root.display(), "File store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, collection: &str, key: &str) -> PathBuf {
        self.root
            .join(collection)
            .join(format!("{}.json", file_stem(key)))
    }

    async fn read<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>, AppError> {
        let path = self.record_path(collection, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn write<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<(), AppError> {
        let path = self.record_path(collection, key);
        let tmp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec_pretty(value)?;

        let result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &path).await?;
            sync_dir(&self.root.join(collection)).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            tracing::error!(path = %path.display(), error = %e, "Failed to write record");
            return Err(io_error(&path, e));
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, AppError> {
        let path = self.record_path(collection, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn read_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>, AppError> {
        let dir = self.root.join(collection);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // removed between listing and reading
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&path, e)),
            };
            records.push(serde_json::from_slice(&bytes)?);
        }
        Ok(records)
    }
}

impl CheckpointStore for FileStore {
    async fn load_checkpoint(&self, task_type: &str) -> Result<Option<ResumePoint>, AppError> {
        self.read(CHECKPOINTS, task_type).await
    }

    async fn save_checkpoint(&self, point: &ResumePoint) -> Result<(), AppError> {
        self.write(CHECKPOINTS, &point.task_type, point).await
    }

    async fn list_checkpoints(&self) -> Result<Vec<ResumePoint>, AppError> {
        let mut points: Vec<ResumePoint> = self.read_all(CHECKPOINTS).await?;
        points.sort_by(|a, b| a.task_type.cmp(&b.task_type));
        Ok(points)
    }
}

impl FailedTaskStore for FileStore {
    async fn get_task(&self, task_id: &str) -> Result<Option<FailedTask>, AppError> {
        self.read(FAILED_TASKS, task_id).await
    }

    async fn upsert_task(&self, task: &FailedTask) -> Result<(), AppError> {
        self.write(FAILED_TASKS, &task.task_id, task).await
    }

    async fn remove_task(&self, task_id: &str) -> Result<bool, AppError> {
        self.delete(FAILED_TASKS, task_id).await
    }

    async fn list_pending(&self) -> Result<Vec<FailedTask>, AppError> {
        let mut tasks: Vec<FailedTask> = self.read_all(FAILED_TASKS).await?;
        tasks.sort_by_key(|t| t.next_retry_time);
        Ok(tasks)
    }

    async fn dead_letter(&self, task: &FailedTask) -> Result<(), AppError> {
        // Dead letter first: a crash in between leaves a duplicate that the
        // next sweep moves again, never a lost task.
        self.write(DEAD_LETTERS, &task.task_id, task).await?;
        self.delete(FAILED_TASKS, &task.task_id).await?;
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<FailedTask>, AppError> {
        let mut tasks: Vec<FailedTask> = self.read_all(DEAD_LETTERS).await?;
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(tasks)
    }
}

impl RunStore for FileStore {
    async fn put_run(&self, run: &CollectionRun) -> Result<(), AppError> {
        self.write(RUNS, &run.run_id.to_string(), run).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<CollectionRun>, AppError> {
        self.read(RUNS, &run_id.to_string()).await
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<CollectionRun>, AppError> {
        let mut runs: Vec<CollectionRun> = self.read_all(RUNS).await?;
        runs.retain(|r| status.is_none_or(|s| r.status == s));
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }
}
