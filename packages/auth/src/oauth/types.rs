// ABOUTME: Core type definitions for managed OAuth tokens
// ABOUTME: Includes the decrypted token, the intake spec, and provider token responses

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{from_epoch_millis, to_epoch_millis, TokenKey};

use crate::error::{LifecycleError, LifecycleResult};

/// Lifetime assumed when neither the caller nor the provider states one
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Longest lifetime accepted from a caller or a provider (ten years)
pub const MAX_EXPIRES_IN_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// OAuth token in its decrypted, in-memory form
///
/// Secrets never leave the process in this shape: the store encrypts
/// `access_token` and `refresh_token` before anything reaches the database.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub provider: String,
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub scope: BTreeSet<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub refresh_count: u32,
    #[serde(default)]
    pub provider_metadata: serde_json::Map<String, serde_json::Value>,
}

impl OAuthToken {
    /// Build a token from caller input, anchoring its lifetime at `now`
    pub fn from_spec(spec: TokenSpec, now: DateTime<Utc>) -> LifecycleResult<Self> {
        let issued_at = truncate_millis(now);
        let expires_at = match (spec.expires_at, spec.expires_in) {
            (Some(at), _) => {
                let latest = expiry_after(issued_at, MAX_EXPIRES_IN_SECS);
                if latest.is_some_and(|latest| at > latest) {
                    return Err(LifecycleError::InvalidToken(format!(
                        "expires_at {} is too far in the future",
                        at
                    )));
                }
                truncate_millis(at)
            }
            (None, secs) => {
                let secs = secs.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
                expiry_after(issued_at, secs)
                    .filter(|_| secs <= MAX_EXPIRES_IN_SECS)
                    .ok_or_else(|| {
                        LifecycleError::InvalidToken(format!(
                            "expires_in must be at most {} seconds, got {}",
                            MAX_EXPIRES_IN_SECS, secs
                        ))
                    })?
            }
        };

        Ok(Self {
            provider: spec.provider.to_lowercase(),
            user_id: spec.user_id,
            access_token: spec.access_token,
            refresh_token: spec.refresh_token.filter(|t| !t.is_empty()),
            token_type: spec.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: spec.scope.into_iter().collect(),
            issued_at,
            expires_at,
            last_refreshed_at: None,
            refresh_count: 0,
            provider_metadata: spec.provider_metadata,
        })
    }

    pub fn key(&self) -> TokenKey {
        TokenKey::new(&self.provider, &self.user_id)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Milliseconds until expiry; negative once expired
    pub fn ms_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_milliseconds()
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Successor token after a successful refresh exchange
    ///
    /// The provider may omit a new refresh token, in which case the current
    /// one is carried forward. Scope and token type follow the same rule.
    /// A lifetime outside `0..=MAX_EXPIRES_IN_SECS` is a provider error.
    pub fn refreshed(&self, response: TokenResponse, now: DateTime<Utc>) -> LifecycleResult<Self> {
        let now = truncate_millis(now);
        let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let expires_at = Some(expires_in)
            .filter(|secs| (0..=MAX_EXPIRES_IN_SECS).contains(secs))
            .and_then(|secs| expiry_after(now, secs))
            .ok_or_else(|| {
                LifecycleError::ProviderRejected(format!(
                    "{} returned an unusable expires_in of {}",
                    self.provider, expires_in
                ))
            })?;
        let scope = response
            .scope
            .as_deref()
            .map(parse_scope)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.scope.clone());

        Ok(Self {
            provider: self.provider.clone(),
            user_id: self.user_id.clone(),
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .filter(|t| !t.is_empty())
                .or_else(|| self.refresh_token.clone()),
            token_type: response
                .token_type
                .unwrap_or_else(|| self.token_type.clone()),
            scope,
            issued_at: now,
            expires_at,
            last_refreshed_at: Some(now),
            refresh_count: self.refresh_count.saturating_add(1),
            provider_metadata: self.provider_metadata.clone(),
        })
    }

    /// Secret-free view used by the scheduler and health checks
    pub fn snapshot(&self) -> TokenSnapshot {
        TokenSnapshot {
            key: self.key(),
            expires_at: self.expires_at,
            refresh_count: self.refresh_count,
            refreshable: self.can_refresh(),
        }
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("provider", &self.provider)
            .field("user_id", &self.user_id)
            .field("access_token", &"[redacted]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[redacted]"),
            )
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("last_refreshed_at", &self.last_refreshed_at)
            .field("refresh_count", &self.refresh_count)
            .finish()
    }
}

/// Caller-supplied token data accepted by `store_token`
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenSpec {
    pub provider: String,
    pub user_id: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    /// Lifetime in seconds from the moment of storing
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Absolute expiry, takes precedence over `expires_in`
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub provider_metadata: serde_json::Map<String, serde_json::Value>,
}

impl TokenSpec {
    pub fn new(
        provider: impl Into<String>,
        user_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            user_id: user_id.into(),
            access_token: access_token.into(),
            refresh_token: None,
            token_type: None,
            scope: Vec::new(),
            expires_in: None,
            expires_at: None,
            provider_metadata: serde_json::Map::new(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_in(mut self, secs: i64) -> Self {
        self.expires_in = Some(secs);
        self
    }

    pub fn with_scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Debug for TokenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSpec")
            .field("provider", &self.provider)
            .field("user_id", &self.user_id)
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Successful response from a provider token endpoint
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Space-delimited per RFC 6749, some providers use commas
    #[serde(default)]
    pub scope: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("refresh_token_rotated", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Token metadata without secrets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSnapshot {
    pub key: TokenKey,
    pub expires_at: DateTime<Utc>,
    pub refresh_count: u32,
    pub refreshable: bool,
}

impl From<&warden_storage::TokenRecord> for TokenSnapshot {
    fn from(record: &warden_storage::TokenRecord) -> Self {
        Self {
            key: record.key(),
            expires_at: record.expires_at,
            refresh_count: record.refresh_count,
            refreshable: record.refresh_token.is_some(),
        }
    }
}

/// Split a scope string on whitespace or commas
pub fn parse_scope(raw: &str) -> BTreeSet<String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn expiry_after(start: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(secs).and_then(|lifetime| start.checked_add_signed(lifetime))
}

fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    from_epoch_millis(to_epoch_millis(at))
}
