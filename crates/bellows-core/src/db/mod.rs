//! Database module for the Bellows master.

pub mod builder;
pub mod buildset;
pub mod repository;
pub mod slave;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::error::{BellowsError, Result};

/// Database connection pool.
pub type DbPool = SqlitePool;

/// Default maximum database connections.
const DEFAULT_MAX_CONNECTIONS: u32 = 20;

/// Creates and initializes the database connection pool.
///
/// The pool size can be configured via the `DATABASE_MAX_CONNECTIONS`
/// environment variable. The default of 20 connections handles concurrent
/// buildset consumers and stream sessions without exhaustion.
pub async fn create_pool(database_url: &str) -> Result<DbPool> {
    // A pooled in-memory database would be one empty database per
    // connection; keep it on a single connection.
    let max_connections = if database_url.contains(":memory:") {
        1
    } else {
        std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
    };

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| BellowsError::Configuration(format!("Invalid database URL: {}", e)))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    tracing::debug!("Database pool created with max_connections={}", max_connections);

    Ok(pool)
}

/// Runs database migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Formats a timestamp for storage.
pub(crate) fn fmt_dt(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parses a stored timestamp.
pub(crate) fn parse_dt(field: &'static str, s: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BellowsError::DateParse {
            field,
            message: e.to_string(),
        })
}

/// Parses an optional stored timestamp.
pub(crate) fn parse_opt_dt(
    field: &'static str,
    s: Option<String>,
) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_dt(field, &v)).transpose()
}
