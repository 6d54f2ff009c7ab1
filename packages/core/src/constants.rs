use std::env;
use std::path::PathBuf;

/// Name of the data directory under the user's home
pub const DATA_DIR_NAME: &str = ".warden";

/// File name of the SQLite database inside the data directory
pub const DATABASE_FILE_NAME: &str = "warden.db";

/// Get the path to the Warden directory (~/.warden)
pub fn warden_dir() -> PathBuf {
    // First try HOME environment variable (useful for tests)
    if let Ok(home) = env::var("HOME") {
        PathBuf::from(home).join(DATA_DIR_NAME)
    } else {
        dirs::home_dir()
            .unwrap_or_else(env::temp_dir)
            .join(DATA_DIR_NAME)
    }
}

/// Get the path to the token database (~/.warden/warden.db)
pub fn database_file() -> PathBuf {
    warden_dir().join(DATABASE_FILE_NAME)
}
