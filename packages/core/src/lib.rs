// ABOUTME: Core types, constants, and utilities for Warden
// ABOUTME: Foundational package shared by the storage, security, and lifecycle packages

pub mod constants;
pub mod types;
pub mod utils;

// Re-export main types
pub use types::{KeyParseError, TokenKey};

// Re-export constants
pub use constants::{database_file, warden_dir, DATA_DIR_NAME, DATABASE_FILE_NAME};

// Re-export utilities
pub use utils::{from_epoch_millis, jitter_millis, now_millis, to_epoch_millis};
