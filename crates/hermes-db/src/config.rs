use std::time::Duration;

use hermes_core::AppError;

/// Configuration for the database connection pool.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    /// - `DATABASE_ACQUIRE_TIMEOUT` (optional seconds, defaults to 30)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let url = lookup("DATABASE_URL").filter(|u| !u.is_empty()).ok_or_else(|| {
            AppError::ConfigError("DATABASE_URL not set. Required for database operations.".into())
        })?;
        let mut config = Self::new(url);

        if let Some(raw) = lookup("DATABASE_MAX_CONNECTIONS") {
            let parsed: u32 = raw.parse().map_err(|_| {
                AppError::ConfigError(format!(
                    "Invalid DATABASE_MAX_CONNECTIONS '{raw}': must be a positive integer"
                ))
            })?;
            if parsed == 0 {
                return Err(AppError::ConfigError(
                    "DATABASE_MAX_CONNECTIONS must be at least 1".into(),
                ));
            }
            config.max_connections = parsed;
        }

        if let Some(raw) = lookup("DATABASE_ACQUIRE_TIMEOUT") {
            let secs: u64 = raw.parse().map_err(|_| {
                AppError::ConfigError(format!(
                    "Invalid DATABASE_ACQUIRE_TIMEOUT '{raw}': must be whole seconds"
                ))
            })?;
            config.acquire_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}
