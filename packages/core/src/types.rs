// ABOUTME: Identity type shared by every token lifecycle component
// ABOUTME: A token is addressed by the (provider, user id) pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identity of a stored OAuth token: one token per provider and user
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenKey {
    pub provider: String,
    pub user_id: String,
}

impl TokenKey {
    pub fn new(provider: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into().to_lowercase(),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.user_id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid token key '{0}': expected <provider>:<user_id>")]
pub struct KeyParseError(pub String);

impl FromStr for TokenKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Provider names never contain ':', user ids may
        match s.split_once(':') {
            Some((provider, user_id)) if !provider.is_empty() && !user_id.is_empty() => {
                Ok(Self::new(provider, user_id))
            }
            _ => Err(KeyParseError(s.to_string())),
        }
    }
}
