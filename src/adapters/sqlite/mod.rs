//! SQLite database adapters for the fix memory store.

pub mod connection;
pub mod fix_memory_repository;
pub mod migrations;

pub use connection::{create_pool, create_test_pool, ConnectionError, PoolConfig};
pub use fix_memory_repository::SqliteFixMemory;
pub use migrations::{all_embedded_migrations, Migration, MigrationError, Migrator};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use std::path::Path;

use crate::domain::errors::StoreError;

/// Parse an RFC3339 datetime string from a SQLite row field.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Fixed-width RFC3339 so stored timestamps sort lexically.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        Self::MigrationError(err.to_string())
    }
}

pub async fn initialize_database(
    database_url: &str,
    config: Option<PoolConfig>,
) -> Result<SqlitePool, DatabaseError> {
    let pool = create_pool(database_url, config).await?;
    let migrator = Migrator::new(pool.clone());
    migrator
        .run_embedded_migrations(all_embedded_migrations())
        .await?;
    Ok(pool)
}

/// Open (creating if needed) the database file at `path`.
pub async fn initialize_database_at(
    path: &Path,
    config: Option<PoolConfig>,
) -> Result<SqlitePool, DatabaseError> {
    initialize_database(&format!("sqlite:{}", path.display()), config).await
}

/// Create an in-memory test pool with all migrations applied.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, DatabaseError> {
    let pool = create_test_pool().await?;
    let migrator = Migrator::new(pool.clone());
    migrator
        .run_embedded_migrations(all_embedded_migrations())
        .await?;
    Ok(pool)
}
