use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use hermes_core::error::AppError;
use hermes_core::failed_queue::FailedTask;
use hermes_core::traits::FailedTaskStore;

use crate::{json_object, to_column};

/// PostgreSQL-backed failed tasks and dead letters.
///
/// Dead-lettering copies the row and deletes the pending one in a single
/// transaction.
#[derive(Clone)]
pub struct FailedTaskRepository {
    pool: Pool<Postgres>,
}

impl FailedTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct FailedTaskRow {
    task_id: String,
    task_type: String,
    target: String,
    error_message: String,
    retry_count: i32,
    max_retries: i32,
    next_retry_time: DateTime<Utc>,
    created_at: DateTime<Utc>,
    metadata: serde_json::Value,
}

impl From<FailedTaskRow> for FailedTask {
    fn from(row: FailedTaskRow) -> Self {
        FailedTask {
            task_id: row.task_id,
            task_type: row.task_type,
            target: row.target,
            error_message: row.error_message,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            max_retries: u32::try_from(row.max_retries).unwrap_or(0),
            next_retry_time: row.next_retry_time,
            created_at: row.created_at,
            metadata: json_object(row.metadata),
        }
    }
}

const COLUMNS: &str = "task_id, task_type, target, error_message, retry_count, max_retries, \
                       next_retry_time, created_at, metadata";

fn db_error(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

impl FailedTaskStore for FailedTaskRepository {
    async fn get_task(&self, task_id: &str) -> Result<Option<FailedTask>, AppError> {
        let row = sqlx::query_as::<_, FailedTaskRow>(&format!(
            "SELECT {COLUMNS} FROM failed_tasks WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn upsert_task(&self, task: &FailedTask) -> Result<(), AppError> {
        let retry_count: i32 = to_column(task.retry_count, "retry_count")?;
        let max_retries: i32 = to_column(task.max_retries, "max_retries")?;

        sqlx::query(
            r#"
            INSERT INTO failed_tasks
                (task_id, task_type, target, error_message, retry_count, max_retries,
                 next_retry_time, created_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (task_id) DO UPDATE SET
                error_message = EXCLUDED.error_message,
                retry_count = EXCLUDED.retry_count,
                max_retries = EXCLUDED.max_retries,
                next_retry_time = EXCLUDED.next_retry_time,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.task_type)
        .bind(&task.target)
        .bind(&task.error_message)
        .bind(retry_count)
        .bind(max_retries)
        .bind(task.next_retry_time)
        .bind(task.created_at)
        .bind(serde_json::Value::Object(task.metadata.clone()))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn remove_task(&self, task_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM failed_tasks WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_pending(&self) -> Result<Vec<FailedTask>, AppError> {
        let rows = sqlx::query_as::<_, FailedTaskRow>(&format!(
            "SELECT {COLUMNS} FROM failed_tasks ORDER BY next_retry_time, task_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn dead_letter(&self, task: &FailedTask) -> Result<(), AppError> {
        let retry_count: i32 = to_column(task.retry_count, "retry_count")?;
        let max_retries: i32 = to_column(task.max_retries, "max_retries")?;

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query(
            r#"
            INSERT INTO dead_letter_tasks
                (task_id, task_type, target, error_message, retry_count, max_retries,
                 next_retry_time, created_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (task_id) DO UPDATE SET
                error_message = EXCLUDED.error_message,
                retry_count = EXCLUDED.retry_count,
                max_retries = EXCLUDED.max_retries,
                next_retry_time = EXCLUDED.next_retry_time,
                metadata = EXCLUDED.metadata,
                dead_lettered_at = NOW()
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.task_type)
        .bind(&task.target)
        .bind(&task.error_message)
        .bind(retry_count)
        .bind(max_retries)
        .bind(task.next_retry_time)
        .bind(task.created_at)
        .bind(serde_json::Value::Object(task.metadata.clone()))
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        sqlx::query("DELETE FROM failed_tasks WHERE task_id = $1")
            .bind(&task.task_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<FailedTask>, AppError> {
        let rows = sqlx::query_as::<_, FailedTaskRow>(&format!(
            "SELECT {COLUMNS} FROM dead_letter_tasks ORDER BY task_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
