// ABOUTME: Lifecycle events broadcast to in-process subscribers
// ABOUTME: Stored, refreshed, refresh-failed, revoked, and removed notifications per token

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use warden_core::TokenKey;

/// What started a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
    /// Scheduled ahead of expiry
    Proactive,
    /// Armed late by the health sweep, closer to expiry
    Backstop,
    /// A read found the token expired
    Reactive,
    /// Explicit `refresh_token` call
    Manual,
}

/// Why a refresh did not produce a new token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshFailureReason {
    RefreshTokenInvalid,
    NoRefreshToken,
    ProviderRejected,
    RetriesExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Stored {
        key: TokenKey,
        expires_at: DateTime<Utc>,
    },
    Refreshed {
        key: TokenKey,
        refresh_count: u32,
        expires_at: DateTime<Utc>,
        trigger: RefreshTrigger,
    },
    RefreshFailed {
        key: TokenKey,
        reason: RefreshFailureReason,
        /// The token was removed or flagged and will not be retried automatically
        terminal: bool,
        message: String,
    },
    Revoked {
        key: TokenKey,
        /// Whether the provider confirmed revocation remotely
        remote: bool,
    },
    Removed {
        key: TokenKey,
    },
}

impl LifecycleEvent {
    /// Dotted event name used in logs and by subscribers filtering on kind
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stored { .. } => "token.stored",
            Self::Refreshed { .. } => "token.refreshed",
            Self::RefreshFailed { .. } => "token.refresh.failed",
            Self::Revoked { .. } => "token.revoked",
            Self::Removed { .. } => "token.removed",
        }
    }

    pub fn key(&self) -> &TokenKey {
        match self {
            Self::Stored { key, .. }
            | Self::Refreshed { key, .. }
            | Self::RefreshFailed { key, .. }
            | Self::Revoked { key, .. }
            | Self::Removed { key } => key,
        }
    }
}

/// Fan-out of lifecycle events; sending never blocks or fails the caller
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        debug!("{} {}", event.name(), event.key());
        if let Err(e) = self.tx.send(event) {
            // No receivers is the normal case when nobody subscribed
            if self.tx.receiver_count() > 0 {
                warn!("Failed to broadcast lifecycle event: {}", e);
            }
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
