use hermes_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::checkpoint_repository::CheckpointRepository;
use crate::config::DatabaseConfig;
use crate::failed_task_repository::FailedTaskRepository;
use crate::run_repository::RunRepository;

/// Central database facade: owns the connection pool, runs migrations,
/// and vends repository instances.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::debug!(max_connections = config.max_connections, "Database pool ready");
        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get a [`CheckpointRepository`] backed by this pool.
    pub fn checkpoint_repo(&self) -> CheckpointRepository {
        CheckpointRepository::new(self.pool.clone())
    }

    /// Get a [`FailedTaskRepository`] backed by this pool.
    pub fn failed_task_repo(&self) -> FailedTaskRepository {
        FailedTaskRepository::new(self.pool.clone())
    }

    /// Get a [`RunRepository`] backed by this pool.
    pub fn run_repo(&self) -> RunRepository {
        RunRepository::new(self.pool.clone())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
