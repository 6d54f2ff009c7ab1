// ABOUTME: HTTP client for provider token, revocation, and introspection endpoints
// ABOUTME: Classifies provider failures as transient or terminal and rate limits each provider

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{header::ACCEPT, Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use warden_core::TokenKey;

use crate::error::{LifecycleError, LifecycleResult};
use crate::oauth::provider::{ProviderConfig, ProviderRegistry};
use crate::oauth::types::TokenResponse;

type ProviderLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Error codes meaning the refresh token itself is dead
const DEAD_GRANT_CODES: &[&str] = &["invalid_grant", "bad_refresh_token"];

/// Error codes meaning our client registration is wrong
const CLIENT_REJECTED_CODES: &[&str] = &["invalid_client", "unauthorized_client"];

/// OAuth error body per RFC 6749 section 5.2
#[derive(Debug, Default, Deserialize)]
struct OAuthErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// Result of an RFC 7662 introspection call
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Introspection {
    pub active: bool,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Expiry as seconds since the epoch
    #[serde(default)]
    pub exp: Option<i64>,
}

/// Which secret a revocation request carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTypeHint {
    AccessToken,
    RefreshToken,
}

impl TokenTypeHint {
    fn as_str(&self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
        }
    }
}

/// Talks to provider endpoints on behalf of the store and the manager
#[derive(Clone)]
pub struct ProviderClient {
    http: Client,
    registry: Arc<ProviderRegistry>,
    limiters: Arc<HashMap<String, Arc<ProviderLimiter>>>,
}

impl ProviderClient {
    pub fn new(registry: Arc<ProviderRegistry>, timeout: Duration) -> LifecycleResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LifecycleError::Configuration(format!("HTTP client: {}", e)))?;

        let limiters = registry
            .iter()
            .filter_map(|provider| {
                NonZeroU32::new(provider.rate_limit_rpm).map(|rpm| {
                    debug!(
                        "Rate limiting {} token endpoint to {} requests/minute",
                        provider.name, rpm
                    );
                    (
                        provider.name.clone(),
                        Arc::new(RateLimiter::direct(Quota::per_minute(rpm))),
                    )
                })
            })
            .collect();

        Ok(Self {
            http,
            registry,
            limiters: Arc::new(limiters),
        })
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Exchange a refresh token for a new access token
    pub async fn refresh(&self, key: &TokenKey, refresh_token: &str) -> LifecycleResult<TokenResponse> {
        let provider = self.registry.get(&key.provider)?;
        self.throttle(provider).await;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", provider.client_id.as_str()),
        ];
        if let Some(secret) = provider.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        debug!("Requesting token refresh for {}", key);
        let response = self
            .http
            .post(&provider.token_url)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_error(provider, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(provider, e))?;

        if !status.is_success() {
            // Don't leak the response body: it can echo the refresh token
            warn!("Token refresh for {} failed with status {}", key, status);
            return Err(classify_failure(key, status, &body));
        }

        // Some providers report grant errors with a 200 status
        if let Ok(err) = serde_json::from_str::<OAuthErrorBody>(&body) {
            if err.error.is_some() {
                warn!("Token refresh for {} returned an error body", key);
                return Err(classify_failure(key, status, &body));
            }
        }

        let parsed = serde_json::from_str::<TokenResponse>(&body).map_err(|e| {
            error!("Malformed token response from {}: {}", provider.name, e);
            LifecycleError::RefreshTransient(format!(
                "{} returned an unreadable token response",
                provider.name
            ))
        })?;
        if provider.rotates_refresh_tokens && parsed.refresh_token.is_none() {
            warn!(
                "{} rotates refresh tokens but returned none for {}; keeping the previous one",
                provider.name, key
            );
        }
        Ok(parsed)
    }

    /// Revoke a token at the provider per RFC 7009
    ///
    /// Returns `false` when the provider has no revocation endpoint.
    pub async fn revoke(
        &self,
        provider_name: &str,
        token: &str,
        hint: TokenTypeHint,
    ) -> LifecycleResult<bool> {
        let provider = self.registry.get(provider_name)?;
        let Some(url) = provider.revoke_url.as_deref() else {
            debug!("{} has no revocation endpoint", provider.name);
            return Ok(false);
        };
        self.throttle(provider).await;

        let mut form = vec![
            ("token", token),
            ("token_type_hint", hint.as_str()),
            ("client_id", provider.client_id.as_str()),
        ];
        if let Some(secret) = provider.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| LifecycleError::RevokeFailed(format!("{}: {}", provider.name, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LifecycleError::RevokeFailed(format!(
                "{} returned status {}",
                provider.name, status
            )));
        }

        info!("Revoked {} at {}", hint.as_str(), provider.name);
        Ok(true)
    }

    /// Ask the provider whether a token is still active per RFC 7662
    pub async fn introspect(&self, provider_name: &str, token: &str) -> LifecycleResult<Introspection> {
        let provider = self.registry.get(provider_name)?;
        let url = provider.introspect_url.as_deref().ok_or_else(|| {
            LifecycleError::ProviderNotConfigured(format!(
                "{} has no introspection endpoint",
                provider.name
            ))
        })?;
        self.throttle(provider).await;

        let mut form = vec![
            ("token", token),
            ("client_id", provider.client_id.as_str()),
        ];
        if let Some(secret) = provider.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_error(provider, e))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LifecycleError::RefreshTransient(format!(
                "{} introspection returned status {}",
                provider.name, status
            )));
        }
        if !status.is_success() {
            return Err(LifecycleError::ProviderRejected(format!(
                "{} introspection returned status {}",
                provider.name, status
            )));
        }

        response.json::<Introspection>().await.map_err(|e| {
            LifecycleError::RefreshTransient(format!(
                "{} returned an unreadable introspection response: {}",
                provider.name, e
            ))
        })
    }

    async fn throttle(&self, provider: &ProviderConfig) {
        if let Some(limiter) = self.limiters.get(&provider.name) {
            if limiter.check().is_err() {
                debug!("Waiting for {} rate limit budget", provider.name);
                limiter.until_ready().await;
            }
        }
    }
}

fn transport_error(provider: &ProviderConfig, err: reqwest::Error) -> LifecycleError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    warn!("Request to {} {}: {}", provider.name, kind, err);
    LifecycleError::RefreshTransient(format!("{} {}", provider.name, kind))
}

/// Map a failed token endpoint response to a lifecycle error
///
/// A dead grant is terminal whatever the status. Otherwise server errors,
/// throttling, and request timeouts are transient and any other 4xx is a
/// provider rejection.
pub fn classify_failure(key: &TokenKey, status: StatusCode, body: &str) -> LifecycleError {
    let parsed: OAuthErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.error.as_deref().unwrap_or_default();
    let detail = match parsed.error_description.as_deref() {
        Some(description) => format!("{} ({})", code, description),
        None if !code.is_empty() => code.to_string(),
        None => format!("status {}", status),
    };

    if DEAD_GRANT_CODES.contains(&code) {
        return LifecycleError::RefreshTokenInvalid {
            key: key.clone(),
            reason: detail,
        };
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return LifecycleError::RefreshTransient(detail);
    }
    if CLIENT_REJECTED_CODES.contains(&code) {
        return LifecycleError::ProviderRejected(format!("client rejected: {}", detail));
    }
    LifecycleError::ProviderRejected(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn key() -> TokenKey {
        TokenKey::new("google", "u1")
    }

    #[rstest]
    #[case(StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#)]
    #[case(StatusCode::UNAUTHORIZED, r#"{"error":"invalid_grant","error_description":"revoked"}"#)]
    #[case(StatusCode::OK, r#"{"error":"bad_refresh_token"}"#)]
    fn test_dead_grant_is_terminal(#[case] status: StatusCode, #[case] body: &str) {
        let err = classify_failure(&key(), status, body);
        assert!(matches!(err, LifecycleError::RefreshTokenInvalid { .. }));
        assert!(err.is_terminal());
    }

    #[rstest]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, "")]
    #[case(StatusCode::SERVICE_UNAVAILABLE, "<html>down</html>")]
    #[case(StatusCode::TOO_MANY_REQUESTS, r#"{"error":"slow_down"}"#)]
    #[case(StatusCode::REQUEST_TIMEOUT, "")]
    fn test_server_side_failures_are_transient(#[case] status: StatusCode, #[case] body: &str) {
        let err = classify_failure(&key(), status, body);
        assert!(err.is_transient(), "{:?} should be transient", err);
    }

    #[rstest]
    #[case(StatusCode::UNAUTHORIZED, r#"{"error":"invalid_client"}"#)]
    #[case(StatusCode::BAD_REQUEST, r#"{"error":"unsupported_grant_type"}"#)]
    #[case(StatusCode::FORBIDDEN, "")]
    fn test_other_client_errors_are_rejections(#[case] status: StatusCode, #[case] body: &str) {
        let err = classify_failure(&key(), status, body);
        assert!(matches!(err, LifecycleError::ProviderRejected(_)));
    }

    #[test]
    fn test_reason_includes_description() {
        let err = classify_failure(
            &key(),
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
        );
        assert!(err.to_string().contains("Token has been expired or revoked."));
    }
}
