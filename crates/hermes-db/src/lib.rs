pub mod checkpoint_repository;
pub mod config;
pub mod database;
pub mod failed_task_repository;
pub mod run_repository;

pub use checkpoint_repository::CheckpointRepository;
pub use config::DatabaseConfig;
pub use database::Database;
pub use failed_task_repository::FailedTaskRepository;
pub use run_repository::RunRepository;

use std::fmt::Display;

use hermes_core::AppError;

/// A JSONB column as a JSON object; anything else reads as empty.
pub(crate) fn json_object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

/// A counter as its column type, failing instead of wrapping.
pub(crate) fn to_column<T, C>(value: T, column: &str) -> Result<C, AppError>
where
    T: Copy + Display,
    C: TryFrom<T>,
{
    C::try_from(value)
        .map_err(|_| AppError::DatabaseError(format!("{column} value {value} is out of range")))
}
