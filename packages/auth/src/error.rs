// ABOUTME: Error types for the token lifecycle manager
// ABOUTME: Separates transient refresh failures from terminal ones so callers can decide to retry

use thiserror::Error;

use warden_config::ConfigError;
use warden_core::TokenKey;
use warden_security::EncryptionError;
use warden_storage::StorageError;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Token not found: {0}")]
    TokenNotFound(TokenKey),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("No refresh token available for {0}")]
    NoRefreshToken(TokenKey),

    #[error("Token refresh failed temporarily: {0}")]
    RefreshTransient(String),

    #[error("Refresh token for {key} was rejected: {reason}")]
    RefreshTokenInvalid { key: TokenKey, reason: String },

    #[error("Provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("Token revocation failed: {0}")]
    RevokeFailed(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl LifecycleError {
    /// Failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RefreshTransient(_) | Self::StorageUnavailable(_))
    }

    /// Failures the token cannot recover from without a new grant or operator action
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoRefreshToken(_) | Self::RefreshTokenInvalid { .. } | Self::ProviderRejected(_)
        )
    }
}

impl From<ConfigError> for LifecycleError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let key = TokenKey::new("google", "u1");
        assert!(LifecycleError::RefreshTransient("503".into()).is_transient());
        assert!(!LifecycleError::RefreshTransient("503".into()).is_terminal());

        let invalid = LifecycleError::RefreshTokenInvalid {
            key: key.clone(),
            reason: "invalid_grant".into(),
        };
        assert!(invalid.is_terminal());
        assert!(!invalid.is_transient());

        assert!(LifecycleError::NoRefreshToken(key.clone()).is_terminal());
        assert!(!LifecycleError::TokenNotFound(key).is_terminal());
        assert!(!LifecycleError::RevokeFailed("timeout".into()).is_transient());
    }

    #[test]
    fn test_config_error_conversion() {
        let err: LifecycleError = ConfigError::InvalidValue {
            var: "WARDEN_REFRESH_WORKERS".into(),
            value: "x".into(),
        }
        .into();
        assert!(matches!(err, LifecycleError::Configuration(msg) if msg.contains("WARDEN_REFRESH_WORKERS")));
    }
}
