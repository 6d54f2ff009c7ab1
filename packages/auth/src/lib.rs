// ABOUTME: Warden token lifecycle library for third-party OAuth tokens
// ABOUTME: Stores tokens encrypted, refreshes them before expiry, and reports their health

pub mod error;
pub mod oauth;

// Re-export main types
pub use error::{LifecycleError, LifecycleResult};
pub use oauth::{
    HealthStatus, KnownProvider, LifecycleEvent, LifecycleManager, OAuthToken, ProviderConfig,
    ProviderRegistry, RefreshFailureReason, RefreshTrigger, RiskLevel, TokenMetrics, TokenSpec,
};
