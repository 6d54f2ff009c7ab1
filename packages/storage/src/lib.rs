// ABOUTME: Durable storage layer for encrypted OAuth token records
// ABOUTME: SQLite connection setup, embedded migrations, and the token repository

pub mod database;
pub mod error;
pub mod tokens;

pub use database::{connect, connect_with_options};
pub use error::{StorageError, StorageResult};
pub use tokens::{CasOutcome, SqliteTokenRepository, TokenRecord, TokenRepository};
