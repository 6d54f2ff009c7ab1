pub mod serve;
pub mod tokens;

use anyhow::{Context, Result};
use warden_auth::LifecycleManager;

/// Build a manager from WARDEN_* settings and the .env file
pub async fn open_manager() -> Result<LifecycleManager> {
    LifecycleManager::from_env()
        .await
        .context("Failed to initialize the lifecycle manager")
}
