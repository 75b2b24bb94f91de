use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use hermes_core::checkpoint::ResumePoint;
use hermes_core::error::AppError;
use hermes_core::traits::CheckpointStore;

use crate::{json_object, to_column};

/// PostgreSQL-backed resume points, one row per task type.
#[derive(Clone)]
pub struct CheckpointRepository {
    pool: Pool<Postgres>,
}

impl CheckpointRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    task_type: String,
    current_page: i64,
    last_cursor: Option<String>,
    last_item: Option<String>,
    total_processed: i64,
    last_update: DateTime<Utc>,
    metadata: serde_json::Value,
}

impl From<CheckpointRow> for ResumePoint {
    fn from(row: CheckpointRow) -> Self {
        ResumePoint {
            task_type: row.task_type,
            current_page: u64::try_from(row.current_page).unwrap_or(0),
            last_cursor: row.last_cursor,
            last_item: row.last_item,
            total_processed: u64::try_from(row.total_processed).unwrap_or(0),
            last_update: row.last_update,
            metadata: json_object(row.metadata),
        }
    }
}

impl CheckpointStore for CheckpointRepository {
    async fn load_checkpoint(&self, task_type: &str) -> Result<Option<ResumePoint>, AppError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT task_type, current_page, last_cursor, last_item, total_processed, last_update, metadata
            FROM checkpoints
            WHERE task_type = $1
            "#,
        )
        .bind(task_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn save_checkpoint(&self, point: &ResumePoint) -> Result<(), AppError> {
        let current_page: i64 = to_column(point.current_page, "current_page")?;
        let total_processed: i64 = to_column(point.total_processed, "total_processed")?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints
                (task_type, current_page, last_cursor, last_item, total_processed, last_update, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (task_type) DO UPDATE SET
                current_page = EXCLUDED.current_page,
                last_cursor = EXCLUDED.last_cursor,
                last_item = EXCLUDED.last_item,
                total_processed = EXCLUDED.total_processed,
                last_update = EXCLUDED.last_update,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(&point.task_type)
        .bind(current_page)
        .bind(&point.last_cursor)
        .bind(&point.last_item)
        .bind(total_processed)
        .bind(point.last_update)
        .bind(serde_json::Value::Object(point.metadata.clone()))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<ResumePoint>, AppError> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT task_type, current_page, last_cursor, last_item, total_processed, last_update, metadata
            FROM checkpoints
            ORDER BY task_type
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
