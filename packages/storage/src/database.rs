// ABOUTME: SQLite pool construction and schema migrations
// ABOUTME: Creates the data directory on demand and enables WAL for concurrent readers

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::StorageResult;

/// Default pool size for file-backed databases
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Open a pool for `database_url` and run migrations
pub async fn connect(database_url: &str) -> StorageResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    connect_with_options(options).await
}

/// Open a pool with explicit connect options and run migrations
pub async fn connect_with_options(options: SqliteConnectOptions) -> StorageResult<SqlitePool> {
    let filename = options.get_filename().to_path_buf();
    let in_memory = filename.as_os_str().is_empty() || filename.to_string_lossy().contains(":memory:");

    // Every in-memory connection is its own database, so pin the pool to one
    let (options, max_connections) = if in_memory {
        (options, 1)
    } else {
        if let Some(parent) = filename.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        (
            options.journal_mode(SqliteJournalMode::Wal),
            DEFAULT_MAX_CONNECTIONS,
        )
    };

    debug!(
        "Opening token database at {} ({} connections)",
        filename.display(),
        max_connections
    );

    let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
    if in_memory {
        // Dropping the only connection would drop the database with it
        pool_options = pool_options
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = pool_options.connect_with(options).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Token database ready");
    Ok(pool)
}
