//! Dispatch store bootstrap.
//!
//! Opens the SQLite pool the repositories share and stamps the schema
//! in. The dispatch path works in short write transactions (claim,
//! requeue, heartbeat), so the pool runs WAL with a busy timeout sized
//! for a full worker fleet pulling at once; failures surface as
//! [`DomainError`] like every other store operation.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::DatabaseConfig;

/// Version stamped into `schema_version`; bump together with
/// `schema/dispatch.sql`.
pub const SCHEMA_VERSION: i64 = 1;

const DISPATCH_SCHEMA: &str = include_str!("../../../schema/dispatch.sql");

// A claim transaction holds the write lock for a candidate select plus
// a handful of row updates; a pull burst from every worker in a large
// fleet still clears in well under these windows.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the dispatch store, creating the database file (and its parent
/// directory) on first run.
pub async fn open(config: &DatabaseConfig) -> DomainResult<SqlitePool> {
    let path = Path::new(&config.path);
    ensure_parent_dir(path)?;

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// In-memory store with the schema applied, for tests. Single
/// connection: every statement of a claim transaction must see the one
/// database.
pub async fn open_in_memory() -> DomainResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

/// Apply the dispatch schema if this database predates
/// [`SCHEMA_VERSION`]. Returns whether the script ran.
pub async fn ensure_schema(pool: &SqlitePool) -> DomainResult<bool> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    if schema_version(pool).await? >= SCHEMA_VERSION {
        return Ok(false);
    }

    sqlx::raw_sql(DISPATCH_SCHEMA).execute(pool).await?;
    sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;
    Ok(true)
}

/// Highest stamped schema version; 0 for a fresh database.
pub async fn schema_version(pool: &SqlitePool) -> DomainResult<i64> {
    let (version,): (Option<i64>,) = sqlx::query_as("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

fn ensure_parent_dir(path: &Path) -> DomainResult<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() || parent.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|e| {
        DomainError::DatabaseError(format!(
            "cannot create database directory {}: {e}",
            parent.display()
        ))
    })
}
