use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use hermes_core::error::AppError;
use hermes_core::runs::{CollectionRun, RunStatus};
use hermes_core::traits::RunStore;

use crate::to_column;

/// PostgreSQL-backed collection-run bookkeeping.
#[derive(Clone)]
pub struct RunRepository {
    pool: Pool<Postgres>,
}

impl RunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct CollectionRunRow {
    run_id: Uuid,
    task_type: String,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    pages: i64,
    items: i64,
    failures: i64,
    error_message: Option<String>,
}

impl From<CollectionRunRow> for CollectionRun {
    fn from(row: CollectionRunRow) -> Self {
        CollectionRun {
            run_id: row.run_id,
            task_type: row.task_type,
            status: row.status.parse().unwrap_or(RunStatus::Failed),
            started_at: row.started_at,
            ended_at: row.ended_at,
            pages: u64::try_from(row.pages).unwrap_or(0),
            items: u64::try_from(row.items).unwrap_or(0),
            failures: u64::try_from(row.failures).unwrap_or(0),
            error_message: row.error_message,
        }
    }
}

impl RunStore for RunRepository {
    async fn put_run(&self, run: &CollectionRun) -> Result<(), AppError> {
        let pages: i64 = to_column(run.pages, "pages")?;
        let items: i64 = to_column(run.items, "items")?;
        let failures: i64 = to_column(run.failures, "failures")?;

        sqlx::query(
            r#"
            INSERT INTO collection_runs
                (run_id, task_type, status, started_at, ended_at, pages, items, failures, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (run_id) DO UPDATE SET
                status = EXCLUDED.status,
                ended_at = EXCLUDED.ended_at,
                pages = EXCLUDED.pages,
                items = EXCLUDED.items,
                failures = EXCLUDED.failures,
                error_message = EXCLUDED.error_message
            "#,
        )
        .bind(run.run_id)
        .bind(&run.task_type)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(pages)
        .bind(items)
        .bind(failures)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<CollectionRun>, AppError> {
        let row = sqlx::query_as::<_, CollectionRunRow>(
            r#"
            SELECT run_id, task_type, status, started_at, ended_at, pages, items, failures, error_message
            FROM collection_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<CollectionRun>, AppError> {
        let rows = sqlx::query_as::<_, CollectionRunRow>(
            r#"
            SELECT run_id, task_type, status, started_at, ended_at, pages, items, failures, error_message
            FROM collection_runs
            WHERE $1::VARCHAR IS NULL OR status = $1
            ORDER BY started_at
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
