//! SQLite pool setup shared by the persistent stores

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::error::Result;

const MAX_CONNECTIONS: u32 = 5;

/// Open (creating if needed) a WAL-mode database at `path`.
///
/// `:memory:` opens a private in-memory database on a single connection.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    if path.to_string_lossy() == ":memory:" {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        return Ok(pool);
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    debug!(path = %path.display(), "Opened database");
    Ok(pool)
}
