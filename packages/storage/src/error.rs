// ABOUTME: Error types for the token storage layer
// ABOUTME: Wraps SQLx, migration, and record-format failures

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt token record {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
