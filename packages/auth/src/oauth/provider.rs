// ABOUTME: OAuth provider definitions and the immutable provider registry
// ABOUTME: Built-in endpoints for Google, GitHub, Microsoft, and Zoom with WARDEN_<PROVIDER>_* overrides

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use warden_config::constants::{
    provider_var, CLIENT_ID_SUFFIX, CLIENT_SECRET_SUFFIX, INTROSPECT_URL_SUFFIX,
    RATE_LIMIT_RPM_SUFFIX, REVOKE_URL_SUFFIX, ROTATES_REFRESH_TOKENS_SUFFIX, SCOPES_SUFFIX,
    TOKEN_URL_SUFFIX, WARDEN_PROVIDERS,
};

use crate::error::{LifecycleError, LifecycleResult};
use crate::oauth::types::parse_scope;

/// Providers with built-in endpoint defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnownProvider {
    Google,
    GitHub,
    Microsoft,
    Zoom,
}

impl KnownProvider {
    /// Token endpoint used for the refresh grant
    pub fn token_url(&self) -> &str {
        match self {
            Self::Google => "https://oauth2.googleapis.com/token",
            Self::GitHub => "https://github.com/login/oauth/access_token",
            Self::Microsoft => "https://login.microsoftonline.com/common/oauth2/v2.0/token",
            Self::Zoom => "https://zoom.us/oauth/token",
        }
    }

    /// RFC 7009 revocation endpoint, if the provider has one
    pub fn revoke_url(&self) -> Option<&str> {
        match self {
            Self::Google => Some("https://oauth2.googleapis.com/revoke"),
            Self::Zoom => Some("https://zoom.us/oauth/revoke"),
            Self::GitHub | Self::Microsoft => None,
        }
    }

    /// Whether a refresh grant invalidates the refresh token it consumed
    pub fn rotates_refresh_tokens(&self) -> bool {
        match self {
            Self::Google => false,
            Self::GitHub | Self::Microsoft | Self::Zoom => true,
        }
    }

    /// Requests per minute the token endpoint tolerates from one client
    pub fn default_rate_limit_rpm(&self) -> u32 {
        match self {
            Self::Google => 600,
            Self::GitHub => 60,
            Self::Microsoft => 300,
            Self::Zoom => 60,
        }
    }

    pub fn all() -> Vec<Self> {
        vec![Self::Google, Self::GitHub, Self::Microsoft, Self::Zoom]
    }
}

impl fmt::Display for KnownProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Google => write!(f, "google"),
            Self::GitHub => write!(f, "github"),
            Self::Microsoft => write!(f, "microsoft"),
            Self::Zoom => write!(f, "zoom"),
        }
    }
}

impl FromStr for KnownProvider {
    type Err = LifecycleError;

    fn from_str(s: &str) -> LifecycleResult<Self> {
        match s.to_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "github" => Ok(Self::GitHub),
            "microsoft" => Ok(Self::Microsoft),
            "zoom" => Ok(Self::Zoom),
            _ => Err(LifecycleError::ProviderNotConfigured(format!(
                "Unknown provider: {}. Built-in: google, github, microsoft, zoom",
                s
            ))),
        }
    }
}

/// Credentials and endpoints for one provider
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub name: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub token_url: String,
    pub revoke_url: Option<String>,
    pub introspect_url: Option<String>,
    pub rotates_refresh_tokens: bool,
    /// Applied to stored tokens that arrive without a scope
    pub scopes: Vec<String>,
    /// 0 disables client-side rate limiting
    pub rate_limit_rpm: u32,
}

impl ProviderConfig {
    pub fn new(
        name: impl Into<String>,
        client_id: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into().to_lowercase(),
            client_id: client_id.into(),
            client_secret: None,
            token_url: token_url.into(),
            revoke_url: None,
            introspect_url: None,
            rotates_refresh_tokens: false,
            scopes: Vec::new(),
            rate_limit_rpm: 0,
        }
    }

    /// Defaults for a built-in provider
    pub fn known(provider: KnownProvider, client_id: impl Into<String>) -> Self {
        Self {
            name: provider.to_string(),
            client_id: client_id.into(),
            client_secret: None,
            token_url: provider.token_url().to_string(),
            revoke_url: provider.revoke_url().map(str::to_string),
            introspect_url: None,
            rotates_refresh_tokens: provider.rotates_refresh_tokens(),
            scopes: Vec::new(),
            rate_limit_rpm: provider.default_rate_limit_rpm(),
        }
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_revoke_url(mut self, url: impl Into<String>) -> Self {
        self.revoke_url = Some(url.into());
        self
    }

    pub fn with_introspect_url(mut self, url: impl Into<String>) -> Self {
        self.introspect_url = Some(url.into());
        self
    }

    pub fn with_rate_limit_rpm(mut self, rpm: u32) -> Self {
        self.rate_limit_rpm = rpm;
        self
    }

    pub fn with_rotation(mut self, rotates: bool) -> Self {
        self.rotates_refresh_tokens = rotates;
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    fn validate(&self) -> LifecycleResult<()> {
        if self.client_id.trim().is_empty() {
            return Err(LifecycleError::Configuration(format!(
                "Provider {} has an empty client id",
                self.name
            )));
        }
        let urls = std::iter::once(("token", Some(&self.token_url)))
            .chain([
                ("revoke", self.revoke_url.as_ref()),
                ("introspect", self.introspect_url.as_ref()),
            ]);
        for (label, url) in urls {
            if let Some(url) = url {
                Url::parse(url).map_err(|e| {
                    LifecycleError::Configuration(format!(
                        "Provider {} has an invalid {} URL '{}': {}",
                        self.name, label, url, e
                    ))
                })?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[redacted]"))
            .field("token_url", &self.token_url)
            .field("revoke_url", &self.revoke_url)
            .field("introspect_url", &self.introspect_url)
            .field("rotates_refresh_tokens", &self.rotates_refresh_tokens)
            .field("scopes", &self.scopes)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .finish()
    }
}

/// Provider lookup table, fixed once built
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    /// Build a registry from explicit provider configs
    pub fn new(providers: impl IntoIterator<Item = ProviderConfig>) -> LifecycleResult<Self> {
        let mut registry = Self::default();
        for config in providers {
            config.validate()?;
            if registry.providers.contains_key(&config.name) {
                return Err(LifecycleError::Configuration(format!(
                    "Provider {} registered twice",
                    config.name
                )));
            }
            registry.providers.insert(config.name.clone(), config);
        }
        Ok(registry)
    }

    /// Load providers from the process environment
    pub fn from_env() -> LifecycleResult<Self> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load providers from an arbitrary variable lookup
    ///
    /// A built-in provider is enabled when its client id is set. Additional
    /// providers are listed in `WARDEN_PROVIDERS` and must supply a token URL.
    pub fn from_lookup<F>(lookup: F) -> LifecycleResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str, suffix: &str| {
            lookup(&provider_var(name, suffix)).filter(|v| !v.trim().is_empty())
        };

        let mut configs = Vec::new();

        for provider in KnownProvider::all() {
            let name = provider.to_string();
            let Some(client_id) = get(&name, CLIENT_ID_SUFFIX) else {
                debug!("Provider {} not enabled: no client id", name);
                continue;
            };
            let mut config = ProviderConfig::known(provider, client_id);
            apply_overrides(&mut config, &get)?;
            configs.push(config);
        }

        let extra = lookup(WARDEN_PROVIDERS).unwrap_or_default();
        for name in extra
            .split(',')
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
        {
            if name.parse::<KnownProvider>().is_ok() {
                warn!("{} lists built-in provider {}; ignoring", WARDEN_PROVIDERS, name);
                continue;
            }
            let client_id = get(&name, CLIENT_ID_SUFFIX).ok_or_else(|| {
                LifecycleError::Configuration(format!(
                    "{} is required for provider {}",
                    provider_var(&name, CLIENT_ID_SUFFIX),
                    name
                ))
            })?;
            let token_url = get(&name, TOKEN_URL_SUFFIX).ok_or_else(|| {
                LifecycleError::Configuration(format!(
                    "{} is required for provider {}",
                    provider_var(&name, TOKEN_URL_SUFFIX),
                    name
                ))
            })?;
            let mut config = ProviderConfig::new(&name, client_id, token_url);
            apply_overrides(&mut config, &get)?;
            configs.push(config);
        }

        let registry = Self::new(configs)?;
        info!(
            "Loaded {} OAuth provider(s): {}",
            registry.len(),
            registry.names().join(", ")
        );
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> LifecycleResult<&ProviderConfig> {
        self.providers
            .get(&name.to_lowercase())
            .ok_or_else(|| LifecycleError::ProviderNotConfigured(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(&name.to_lowercase())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn apply_overrides<G>(config: &mut ProviderConfig, get: &G) -> LifecycleResult<()>
where
    G: Fn(&str, &str) -> Option<String>,
{
    let name = config.name.clone();
    if let Some(secret) = get(&name, CLIENT_SECRET_SUFFIX) {
        config.client_secret = Some(secret);
    }
    if let Some(url) = get(&name, TOKEN_URL_SUFFIX) {
        config.token_url = url;
    }
    if let Some(url) = get(&name, REVOKE_URL_SUFFIX) {
        config.revoke_url = Some(url);
    }
    if let Some(url) = get(&name, INTROSPECT_URL_SUFFIX) {
        config.introspect_url = Some(url);
    }
    if let Some(rpm) = get(&name, RATE_LIMIT_RPM_SUFFIX) {
        config.rate_limit_rpm = rpm.trim().parse().map_err(|_| {
            LifecycleError::Configuration(format!(
                "Invalid value for {}: {}",
                provider_var(&name, RATE_LIMIT_RPM_SUFFIX),
                rpm
            ))
        })?;
    }
    if let Some(scopes) = get(&name, SCOPES_SUFFIX) {
        config.scopes = parse_scope(&scopes).into_iter().collect();
    }
    if let Some(flag) = get(&name, ROTATES_REFRESH_TOKENS_SUFFIX) {
        config.rotates_refresh_tokens = match flag.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(LifecycleError::Configuration(format!(
                    "Invalid value for {}: {}",
                    provider_var(&name, ROTATES_REFRESH_TOKENS_SUFFIX),
                    flag
                )))
            }
        };
    }
    Ok(())
}
