// ABOUTME: Aggregated token metrics collected on an interval
// ABOUTME: Totals, expiry, refresh pressure, and per-provider health counts

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use warden_config::LifecycleConfig;

use crate::error::LifecycleResult;
use crate::oauth::health::{score, HealthPolicy};
use crate::oauth::store::TokenStore;
use crate::oauth::types::TokenSnapshot;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderMetrics {
    pub total: usize,
    /// Valid and not yet inside the refresh threshold
    pub healthy: usize,
    pub expired: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenMetrics {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub needing_refresh: usize,
    pub by_provider: BTreeMap<String, ProviderMetrics>,
    pub generated_at: DateTime<Utc>,
}

impl TokenMetrics {
    /// Fold token snapshots into counts as of `now`
    pub fn aggregate<'a, I>(tokens: I, now: DateTime<Utc>, policy: HealthPolicy) -> Self
    where
        I: IntoIterator<Item = &'a TokenSnapshot>,
    {
        let mut metrics = Self {
            total: 0,
            active: 0,
            expired: 0,
            needing_refresh: 0,
            by_provider: BTreeMap::new(),
            generated_at: now,
        };

        for token in tokens {
            let status = score(token.expires_at, token.refresh_count, now, policy);
            let provider = metrics
                .by_provider
                .entry(token.key.provider.clone())
                .or_default();

            metrics.total += 1;
            provider.total += 1;
            if status.is_valid {
                metrics.active += 1;
            } else {
                metrics.expired += 1;
                provider.expired += 1;
            }
            if status.needs_refresh {
                metrics.needing_refresh += 1;
            }
            if status.is_valid && !status.needs_refresh {
                provider.healthy += 1;
            }
        }
        metrics
    }
}

/// Keeps the most recent metrics snapshot
pub struct MetricsAggregator {
    store: Arc<TokenStore>,
    config: LifecycleConfig,
    policy: HealthPolicy,
    latest: RwLock<Option<TokenMetrics>>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<TokenStore>, config: LifecycleConfig) -> Self {
        let policy = HealthPolicy::from(&config);
        Self {
            store,
            config,
            policy,
            latest: RwLock::new(None),
        }
    }

    /// Scan the store and replace the cached snapshot
    pub async fn collect(&self) -> LifecycleResult<TokenMetrics> {
        let tokens = self.store.list().await?;
        let metrics = TokenMetrics::aggregate(&tokens, Utc::now(), self.policy);
        debug!(
            "Collected metrics: {} total, {} expired, {} needing refresh",
            metrics.total, metrics.expired, metrics.needing_refresh
        );
        *self.latest.write().await = Some(metrics.clone());
        Ok(metrics)
    }

    pub async fn latest(&self) -> Option<TokenMetrics> {
        self.latest.read().await.clone()
    }

    /// Cached snapshot, collected on demand before the first tick
    pub async fn get_metrics(&self) -> LifecycleResult<TokenMetrics> {
        if let Some(metrics) = self.latest().await {
            return Ok(metrics);
        }
        self.collect().await
    }

    /// Collect on an interval until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.metrics_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Started metrics aggregator (interval: {}ms)",
            self.config.metrics_interval_ms
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.collect().await {
                        error!("Metrics collection failed: {}", e);
                    }
                }
            }
        }
        info!("Metrics aggregator stopped");
    }
}
