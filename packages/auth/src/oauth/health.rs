// ABOUTME: Token health scoring and the periodic health sweep
// ABOUTME: Scores time-to-expiry into risk bands and arms backstop refreshes for at-risk tokens

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_config::LifecycleConfig;

use crate::error::{LifecycleError, LifecycleResult};
use crate::oauth::events::{EventBus, LifecycleEvent};
use crate::oauth::scheduler::JobState;
use crate::oauth::store::TokenStore;
use crate::oauth::types::TokenSnapshot;

const ONE_MINUTE_MS: i64 = 60 * 1000;
const FIVE_MINUTES_MS: i64 = 5 * ONE_MINUTE_MS;
const FIFTEEN_MINUTES_MS: i64 = 15 * ONE_MINUTE_MS;
const CHURN_PENALTY: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub is_valid: bool,
    pub ms_until_expiry: i64,
    pub needs_refresh: bool,
    pub health_score: u8,
    pub risk_level: RiskLevel,
}

/// Thresholds the score is computed against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub refresh_threshold_ms: u64,
    pub churn_threshold: u32,
}

impl From<&LifecycleConfig> for HealthPolicy {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            refresh_threshold_ms: config.refresh_threshold_ms,
            churn_threshold: config.churn_threshold,
        }
    }
}

/// Health of a token at `now`
pub fn score(
    expires_at: DateTime<Utc>,
    refresh_count: u32,
    now: DateTime<Utc>,
    policy: HealthPolicy,
) -> HealthStatus {
    let ms_until_expiry = (expires_at - now).num_milliseconds();

    let (base, risk_level): (u8, RiskLevel) = match ms_until_expiry {
        ms if ms <= 0 => (0, RiskLevel::Critical),
        ms if ms <= ONE_MINUTE_MS => (20, RiskLevel::Critical),
        ms if ms <= FIVE_MINUTES_MS => (50, RiskLevel::High),
        ms if ms <= FIFTEEN_MINUTES_MS => (75, RiskLevel::Medium),
        _ => (100, RiskLevel::Low),
    };

    // Frequent refreshes hint at a provider handing out short-lived tokens
    let health_score: u8 = if refresh_count > policy.churn_threshold {
        base.saturating_sub(CHURN_PENALTY)
    } else {
        base
    };

    HealthStatus {
        is_valid: ms_until_expiry > 0,
        ms_until_expiry,
        needs_refresh: ms_until_expiry
            <= i64::try_from(policy.refresh_threshold_ms).unwrap_or(i64::MAX),
        health_score,
        risk_level,
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSweepReport {
    pub checked: usize,
    pub degraded: usize,
    pub backstops_armed: usize,
    pub purged: u64,
    pub revoked_upstream: usize,
}

#[derive(Debug, Default)]
struct CheckResult {
    degraded: bool,
    armed: bool,
    revoked: bool,
}

/// Periodically checks every stored token
pub struct HealthMonitor {
    store: Arc<TokenStore>,
    events: EventBus,
    config: LifecycleConfig,
    policy: HealthPolicy,
}

impl HealthMonitor {
    pub fn new(store: Arc<TokenStore>, events: EventBus, config: LifecycleConfig) -> Self {
        let policy = HealthPolicy::from(&config);
        Self {
            store,
            events,
            config,
            policy,
        }
    }

    pub fn policy(&self) -> HealthPolicy {
        self.policy
    }

    pub fn status(&self, token: &TokenSnapshot, now: DateTime<Utc>) -> HealthStatus {
        score(token.expires_at, token.refresh_count, now, self.policy)
    }

    /// Check every stored token once, at most `health_workers` at a time
    pub async fn sweep(&self) -> LifecycleResult<HealthSweepReport> {
        let purged = self.store.purge_evicted().await?;
        let tokens = self.store.list().await?;
        let now = Utc::now();

        let results: Vec<CheckResult> = stream::iter(tokens)
            .map(|token| self.check(token, now))
            .buffer_unordered(self.config.health_workers.max(1))
            .collect()
            .await;

        let report = HealthSweepReport {
            checked: results.len(),
            degraded: results.iter().filter(|r| r.degraded).count(),
            backstops_armed: results.iter().filter(|r| r.armed).count(),
            purged,
            revoked_upstream: results.iter().filter(|r| r.revoked).count(),
        };
        debug!("Health sweep finished: {:?}", report);
        Ok(report)
    }

    async fn check(&self, token: TokenSnapshot, now: DateTime<Utc>) -> CheckResult {
        let status = self.status(&token, now);
        let mut result = CheckResult {
            degraded: status.risk_level >= RiskLevel::High,
            ..CheckResult::default()
        };

        if result.degraded {
            warn!(
                "Token for {} is {} risk (score {}, {}ms left)",
                token.key, status.risk_level, status.health_score, status.ms_until_expiry
            );
        }

        let scheduler = self.store.scheduler();
        if self.config.enable_auto_refresh
            && token.refreshable
            && status.needs_refresh
            && scheduler.job_state(&token.key) == JobState::Idle
        {
            result.armed = scheduler.schedule(&token, false);
            if result.armed {
                info!("Armed backstop refresh for {}", token.key);
            }
        }

        if status.is_valid {
            result.revoked = self.verify_upstream(&token).await;
        }
        result
    }

    /// Drop tokens the provider reports inactive; only for providers with introspection
    async fn verify_upstream(&self, token: &TokenSnapshot) -> bool {
        let client = self.store.client();
        let has_introspection = client
            .registry()
            .get(&token.key.provider)
            .map(|p| p.introspect_url.is_some())
            .unwrap_or(false);
        if !has_introspection {
            return false;
        }

        let stored = match self.store.load(&token.key).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return false,
            Err(e) => {
                warn!("Could not load {} for introspection: {}", token.key, e);
                return false;
            }
        };

        match client
            .introspect(&token.key.provider, &stored.access_token)
            .await
        {
            Ok(introspection) if !introspection.active => {
                warn!("Provider reports token for {} inactive; removing", token.key);
                match self.store.remove_if_unchanged(&token.key, &stored).await {
                    Ok(false) => {
                        debug!("Token for {} was replaced during introspection; keeping it", token.key);
                        false
                    }
                    Ok(true) => {
                        self.events.emit(LifecycleEvent::Revoked {
                            key: token.key.clone(),
                            remote: true,
                        });
                        true
                    }
                    Err(e) => {
                        error!("Failed to remove revoked token {}: {}", token.key, e);
                        false
                    }
                }
            }
            Ok(_) => false,
            Err(e @ LifecycleError::RefreshTransient(_)) => {
                debug!("Introspection for {} failed: {}", token.key, e);
                false
            }
            Err(e) => {
                warn!("Introspection for {} rejected: {}", token.key, e);
                false
            }
        }
    }

    /// Run sweeps on an interval until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.health_check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Started health monitor (interval: {}ms)",
            self.config.health_check_interval_ms
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Health sweep failed: {}", e);
                    }
                }
            }
        }
        info!("Health monitor stopped");
    }
}
