// ABOUTME: Lifecycle configuration loaded from WARDEN_* environment variables
// ABOUTME: Provides defaults, parsing, and validation for refresh policy, workers, and storage

pub mod constants;

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use constants::*;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    #[error("{var} must be at least {min}, got {value}")]
    OutOfRange { var: String, min: u64, value: u64 },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings for the token lifecycle manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub database_url: String,
    /// Name of the environment variable holding the deployment encryption secret
    pub encryption_key_var: String,
    pub enable_auto_refresh: bool,
    pub proactive_refresh_enabled: bool,
    pub refresh_threshold_ms: u64,
    pub max_refresh_attempts: u32,
    pub refresh_retry_delay_ms: u64,
    pub refresh_jitter_ms: u64,
    pub backstop_margin_ms: u64,
    /// Shortest gap between two refreshes of the same token
    pub min_refresh_interval_ms: u64,
    pub refresh_workers: usize,
    pub health_workers: usize,
    pub health_check_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub churn_threshold: u32,
    pub http_timeout_ms: u64,
    pub min_storage_ttl_ms: u64,
    pub cache_capacity: usize,
    pub event_channel_size: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            encryption_key_var: WARDEN_ENCRYPTION_KEY.to_string(),
            enable_auto_refresh: true,
            proactive_refresh_enabled: true,
            refresh_threshold_ms: 5 * 60 * 1000,
            max_refresh_attempts: 3,
            refresh_retry_delay_ms: 5_000,
            refresh_jitter_ms: 5_000,
            backstop_margin_ms: 30_000,
            min_refresh_interval_ms: 30_000,
            refresh_workers: 5,
            health_workers: 10,
            health_check_interval_ms: 5 * 60 * 1000,
            metrics_interval_ms: 60_000,
            churn_threshold: 5,
            http_timeout_ms: 30_000,
            min_storage_ttl_ms: 60 * 60 * 1000,
            cache_capacity: 1_000,
            event_channel_size: 200,
        }
    }
}

impl LifecycleConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            database_url: lookup(WARDEN_DATABASE_URL)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.database_url),
            encryption_key_var: defaults.encryption_key_var,
            enable_auto_refresh: parse_bool(
                &lookup,
                WARDEN_ENABLE_AUTO_REFRESH,
                defaults.enable_auto_refresh,
            )?,
            proactive_refresh_enabled: parse_bool(
                &lookup,
                WARDEN_PROACTIVE_REFRESH_ENABLED,
                defaults.proactive_refresh_enabled,
            )?,
            refresh_threshold_ms: parse(
                &lookup,
                WARDEN_REFRESH_THRESHOLD_MS,
                defaults.refresh_threshold_ms,
            )?,
            max_refresh_attempts: parse(
                &lookup,
                WARDEN_MAX_REFRESH_ATTEMPTS,
                defaults.max_refresh_attempts,
            )?,
            refresh_retry_delay_ms: parse(
                &lookup,
                WARDEN_REFRESH_RETRY_DELAY_MS,
                defaults.refresh_retry_delay_ms,
            )?,
            refresh_jitter_ms: parse(&lookup, WARDEN_REFRESH_JITTER_MS, defaults.refresh_jitter_ms)?,
            backstop_margin_ms: parse(
                &lookup,
                WARDEN_BACKSTOP_MARGIN_MS,
                defaults.backstop_margin_ms,
            )?,
            min_refresh_interval_ms: parse(
                &lookup,
                WARDEN_MIN_REFRESH_INTERVAL_MS,
                defaults.min_refresh_interval_ms,
            )?,
            refresh_workers: parse(&lookup, WARDEN_REFRESH_WORKERS, defaults.refresh_workers)?,
            health_workers: parse(&lookup, WARDEN_HEALTH_WORKERS, defaults.health_workers)?,
            health_check_interval_ms: parse(
                &lookup,
                WARDEN_HEALTH_CHECK_INTERVAL_MS,
                defaults.health_check_interval_ms,
            )?,
            metrics_interval_ms: parse(
                &lookup,
                WARDEN_METRICS_INTERVAL_MS,
                defaults.metrics_interval_ms,
            )?,
            churn_threshold: parse(&lookup, WARDEN_CHURN_THRESHOLD, defaults.churn_threshold)?,
            http_timeout_ms: parse(&lookup, WARDEN_HTTP_TIMEOUT_MS, defaults.http_timeout_ms)?,
            min_storage_ttl_ms: parse(
                &lookup,
                WARDEN_MIN_STORAGE_TTL_MS,
                defaults.min_storage_ttl_ms,
            )?,
            cache_capacity: parse(&lookup, WARDEN_CACHE_CAPACITY, defaults.cache_capacity)?,
            event_channel_size: parse(
                &lookup,
                WARDEN_EVENT_CHANNEL_SIZE,
                defaults.event_channel_size,
            )?,
        };

        config.validate()?;
        debug!(
            "Loaded lifecycle config (auto_refresh={}, threshold={}ms, workers={})",
            config.enable_auto_refresh, config.refresh_threshold_ms, config.refresh_workers
        );
        Ok(config)
    }

    /// Reject settings the lifecycle manager cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        at_least(WARDEN_MAX_REFRESH_ATTEMPTS, self.max_refresh_attempts as u64, 1)?;
        at_least(WARDEN_REFRESH_WORKERS, self.refresh_workers as u64, 1)?;
        at_least(WARDEN_HEALTH_WORKERS, self.health_workers as u64, 1)?;
        at_least(WARDEN_CACHE_CAPACITY, self.cache_capacity as u64, 1)?;
        at_least(WARDEN_EVENT_CHANNEL_SIZE, self.event_channel_size as u64, 1)?;
        at_least(WARDEN_HEALTH_CHECK_INTERVAL_MS, self.health_check_interval_ms, 1_000)?;
        at_least(WARDEN_METRICS_INTERVAL_MS, self.metrics_interval_ms, 1_000)?;
        at_least(WARDEN_HTTP_TIMEOUT_MS, self.http_timeout_ms, 1)?;
        Ok(())
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_millis(self.refresh_threshold_ms)
    }

    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.min_refresh_interval_ms)
    }

    pub fn refresh_retry_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_retry_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn min_storage_ttl(&self) -> Duration {
        Duration::from_millis(self.min_storage_ttl_ms)
    }
}

fn default_database_url() -> String {
    format!("sqlite://{}?mode=rwc", warden_core::database_file().display())
}

fn parse<T, F>(lookup: &F, var: &str, default: T) -> ConfigResult<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidValue {
                    var: var.to_string(),
                    value,
                })
        }
        _ => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, var: &str, default: bool) -> ConfigResult<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(value) => match value.trim().to_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                var: var.to_string(),
                value,
            }),
        },
        None => Ok(default),
    }
}

fn at_least(var: &str, value: u64, min: u64) -> ConfigResult<()> {
    if value < min {
        return Err(ConfigError::OutOfRange {
            var: var.to_string(),
            min,
            value,
        });
    }
    Ok(())
}
