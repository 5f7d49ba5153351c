//! Persistence store (C1): a SQLite pool plus the repository-style query
//! modules for each entity. Every public method here is one transaction, the
//! store's row-level serialization is what the queue state machine relies on
//! for correctness under concurrent workers.

use crate::config::DatabaseConfig;
use crate::errors::AppError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

pub mod channels;
pub mod items;
pub mod queue;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests; a fresh schema per call.
    #[cfg(any(test, feature = "test-fakes"))]
    pub async fn connect_in_memory() -> Result<Self, AppError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Parse a datetime column that may have been written as RFC3339 or (from an
/// externally-populated row) SQLite's `%Y-%m-%d %H:%M:%S` form.
pub(crate) fn parse_datetime(s: &str) -> Result<chrono::DateTime<chrono::Utc>, AppError> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&chrono::Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    Err(AppError::ParseError(format!(
        "unrecognized datetime format: {s}"
    )))
}
