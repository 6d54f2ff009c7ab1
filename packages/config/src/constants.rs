// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Warden

// Storage
pub const WARDEN_DATABASE_URL: &str = "WARDEN_DATABASE_URL";
pub const WARDEN_MIN_STORAGE_TTL_MS: &str = "WARDEN_MIN_STORAGE_TTL_MS";
pub const WARDEN_CACHE_CAPACITY: &str = "WARDEN_CACHE_CAPACITY";

// Encryption
pub const WARDEN_ENCRYPTION_KEY: &str = "WARDEN_ENCRYPTION_KEY";

// Refresh Policy
pub const WARDEN_ENABLE_AUTO_REFRESH: &str = "WARDEN_ENABLE_AUTO_REFRESH";
pub const WARDEN_PROACTIVE_REFRESH_ENABLED: &str = "WARDEN_PROACTIVE_REFRESH_ENABLED";
pub const WARDEN_REFRESH_THRESHOLD_MS: &str = "WARDEN_REFRESH_THRESHOLD_MS";
pub const WARDEN_MAX_REFRESH_ATTEMPTS: &str = "WARDEN_MAX_REFRESH_ATTEMPTS";
pub const WARDEN_REFRESH_RETRY_DELAY_MS: &str = "WARDEN_REFRESH_RETRY_DELAY_MS";
pub const WARDEN_REFRESH_JITTER_MS: &str = "WARDEN_REFRESH_JITTER_MS";
pub const WARDEN_BACKSTOP_MARGIN_MS: &str = "WARDEN_BACKSTOP_MARGIN_MS";
pub const WARDEN_MIN_REFRESH_INTERVAL_MS: &str = "WARDEN_MIN_REFRESH_INTERVAL_MS";

// Workers & Timers
pub const WARDEN_REFRESH_WORKERS: &str = "WARDEN_REFRESH_WORKERS";
pub const WARDEN_HEALTH_WORKERS: &str = "WARDEN_HEALTH_WORKERS";
pub const WARDEN_HEALTH_CHECK_INTERVAL_MS: &str = "WARDEN_HEALTH_CHECK_INTERVAL_MS";
pub const WARDEN_METRICS_INTERVAL_MS: &str = "WARDEN_METRICS_INTERVAL_MS";
pub const WARDEN_CHURN_THRESHOLD: &str = "WARDEN_CHURN_THRESHOLD";

// Network
pub const WARDEN_HTTP_TIMEOUT_MS: &str = "WARDEN_HTTP_TIMEOUT_MS";

// Events
pub const WARDEN_EVENT_CHANNEL_SIZE: &str = "WARDEN_EVENT_CHANNEL_SIZE";

// Comma-separated names of providers beyond the built-in set
pub const WARDEN_PROVIDERS: &str = "WARDEN_PROVIDERS";

// Per-provider settings are read as WARDEN_<PROVIDER>_<SUFFIX>
pub const PROVIDER_PREFIX: &str = "WARDEN_";
pub const CLIENT_ID_SUFFIX: &str = "CLIENT_ID";
pub const CLIENT_SECRET_SUFFIX: &str = "CLIENT_SECRET";
pub const TOKEN_URL_SUFFIX: &str = "TOKEN_URL";
pub const REVOKE_URL_SUFFIX: &str = "REVOKE_URL";
pub const INTROSPECT_URL_SUFFIX: &str = "INTROSPECT_URL";
pub const RATE_LIMIT_RPM_SUFFIX: &str = "RATE_LIMIT_RPM";
pub const ROTATES_REFRESH_TOKENS_SUFFIX: &str = "ROTATES_REFRESH_TOKENS";
pub const SCOPES_SUFFIX: &str = "SCOPES";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";

/// Build the environment variable name for a provider setting
///
/// `provider_var("google", CLIENT_ID_SUFFIX)` yields `WARDEN_GOOGLE_CLIENT_ID`.
pub fn provider_var(provider: &str, suffix: &str) -> String {
    format!(
        "{}{}_{}",
        PROVIDER_PREFIX,
        provider.to_uppercase().replace('-', "_"),
        suffix
    )
}
