// ABOUTME: Encrypted token store combining the LRU cache with durable SQLite records
// ABOUTME: Owns the single-flight refresh path shared by scheduled and on-read refreshes

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use warden_config::LifecycleConfig;
use warden_core::TokenKey;
use warden_security::TokenCipher;
use warden_storage::{CasOutcome, TokenRecord, TokenRepository};

use crate::error::{LifecycleError, LifecycleResult};
use crate::oauth::cache::TokenCache;
use crate::oauth::client::ProviderClient;
use crate::oauth::events::{EventBus, LifecycleEvent, RefreshFailureReason, RefreshTrigger};
use crate::oauth::locks::KeyedLocks;
use crate::oauth::scheduler::{JobHandler, JobOutcome, JobState, RefreshJob, RefreshScheduler};
use crate::oauth::types::{OAuthToken, TokenSnapshot};

/// How a single-flight refresh resolved
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// This call exchanged the refresh token
    Refreshed(OAuthToken),
    /// Another caller already refreshed; its result is returned
    AlreadyFresh(OAuthToken),
}

impl RefreshOutcome {
    pub fn into_token(self) -> OAuthToken {
        match self {
            Self::Refreshed(token) | Self::AlreadyFresh(token) => token,
        }
    }
}

/// Sole writer of token records
pub struct TokenStore {
    config: LifecycleConfig,
    repository: Arc<dyn TokenRepository>,
    cipher: Arc<TokenCipher>,
    cache: TokenCache,
    locks: KeyedLocks,
    client: ProviderClient,
    scheduler: Arc<RefreshScheduler>,
    events: EventBus,
}

impl TokenStore {
    pub fn new(
        config: LifecycleConfig,
        repository: Arc<dyn TokenRepository>,
        cipher: Arc<TokenCipher>,
        client: ProviderClient,
        scheduler: Arc<RefreshScheduler>,
        events: EventBus,
    ) -> Self {
        let cache = TokenCache::new(config.cache_capacity);
        Self {
            config,
            repository,
            cipher,
            cache,
            locks: KeyedLocks::new(),
            client,
            scheduler,
            events,
        }
    }

    pub fn client(&self) -> &ProviderClient {
        &self.client
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    /// Persist a token, replacing any previous one for its key
    pub async fn store(&self, token: &OAuthToken) -> LifecycleResult<()> {
        let key = token.key();
        // Wait out an in-flight refresh so its write cannot land on top of ours
        let _guard = self.locks.lock(&key).await;

        let now = Utc::now();
        let evict_at = self.evict_at(token, now);
        let record = self.encrypt(token, evict_at)?;

        let generation = self.cache.generation();
        self.repository.upsert(&record).await?;
        self.cache
            .insert_if_current(token.clone(), evict_at, generation)
            .await;
        self.scheduler.clear_intervention(&key);

        info!("Stored token for {} (expires {})", key, token.expires_at);
        self.events.emit(LifecycleEvent::Stored {
            key: key.clone(),
            expires_at: token.expires_at,
        });
        self.arm_next_cycle(token, false);
        Ok(())
    }

    /// Read a token without refreshing it
    pub async fn load(&self, key: &TokenKey) -> LifecycleResult<Option<OAuthToken>> {
        let now = Utc::now();
        if let Some(token) = self.cache.get(key, now).await {
            return Ok(Some(token));
        }

        let generation = self.cache.generation();
        let Some(record) = self.repository.fetch(key, now).await? else {
            return Ok(None);
        };
        let token = self.decrypt(&record)?;
        self.cache
            .insert_if_current(token.clone(), record.evict_at, generation)
            .await;
        Ok(Some(token))
    }

    /// Read a usable token, refreshing synchronously if it has expired
    pub async fn get(&self, key: &TokenKey) -> LifecycleResult<Option<OAuthToken>> {
        let Some(token) = self.load(key).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        if !token.is_expired_at(now) {
            self.ensure_backstop(&token, now);
            return Ok(Some(token));
        }

        if !token.can_refresh() {
            if self.remove_if_unchanged(key, &token).await? {
                info!("Token for {} expired without a refresh token; removed", key);
                return Ok(None);
            }
            // Replaced while we were reading; serve whatever is stored now
            return Ok(self.load(key).await?.filter(|t| !t.is_expired_at(Utc::now())));
        }

        if !self.config.enable_auto_refresh {
            debug!("Token for {} expired and auto-refresh is disabled", key);
            return Ok(None);
        }

        debug!("Token for {} expired; refreshing on read", key);
        let outcome = self
            .refresh_with(key, Some(token.refresh_count), RefreshTrigger::Reactive)
            .await?;
        Ok(Some(outcome.into_token()))
    }

    /// Unconditional refresh requested by a caller
    pub async fn refresh(&self, key: &TokenKey) -> LifecycleResult<OAuthToken> {
        self.refresh_with(key, None, RefreshTrigger::Manual)
            .await
            .map(RefreshOutcome::into_token)
    }

    /// Delete a token everywhere; unknown keys are a no-op
    pub async fn remove(&self, key: &TokenKey) -> LifecycleResult<bool> {
        self.scheduler.cancel(key);
        let existed = self.repository.delete(key).await?;
        self.cache.invalidate(key).await;
        self.scheduler.clear_intervention(key);

        if existed {
            info!("Removed token for {}", key);
            self.events
                .emit(LifecycleEvent::Removed { key: key.clone() });
        }
        Ok(existed)
    }

    /// Remove `seen` only if it is still the stored version
    ///
    /// Holds the key lock across the re-read and the delete, so a concurrent
    /// `store` or refresh either lands first and survives, or waits.
    pub async fn remove_if_unchanged(&self, key: &TokenKey, seen: &OAuthToken) -> LifecycleResult<bool> {
        let _guard = self.locks.lock(key).await;
        let unchanged = self
            .load_uncached(key)
            .await?
            .is_some_and(|current| same_version(&current, seen));
        if !unchanged {
            debug!("Token for {} changed since it was read; not removing", key);
            return Ok(false);
        }
        self.remove(key).await
    }

    /// Secret-free view of every live token
    pub async fn list(&self) -> LifecycleResult<Vec<TokenSnapshot>> {
        let records = self.repository.list(Utc::now()).await?;
        Ok(records.iter().map(TokenSnapshot::from).collect())
    }

    pub async fn purge_evicted(&self) -> LifecycleResult<u64> {
        Ok(self.repository.purge_evicted(Utc::now()).await?)
    }

    /// Release the underlying database connections
    pub async fn close(&self) {
        self.cache.clear().await;
        self.repository.close().await;
    }

    /// Single-flight refresh
    ///
    /// With `observed` set, a refresh that already happened since the caller
    /// read the token is returned instead of hitting the provider again. The
    /// result is written with compare-and-swap on `refresh_count`, so a token
    /// removed in the meantime stays removed.
    pub async fn refresh_with(
        &self,
        key: &TokenKey,
        observed: Option<u32>,
        trigger: RefreshTrigger,
    ) -> LifecycleResult<RefreshOutcome> {
        let _guard = self.locks.lock(key).await;

        let current = self
            .load_uncached(key)
            .await?
            .ok_or_else(|| LifecycleError::TokenNotFound(key.clone()))?;

        if let Some(observed) = observed {
            if current.refresh_count != observed {
                debug!("Token for {} was refreshed concurrently", key);
                return Ok(RefreshOutcome::AlreadyFresh(current));
            }
        }

        let Some(refresh_token) = current.refresh_token.as_deref() else {
            warn!("Cannot refresh {}: no refresh token", key);
            self.events.emit(LifecycleEvent::RefreshFailed {
                key: key.clone(),
                reason: RefreshFailureReason::NoRefreshToken,
                terminal: true,
                message: "no refresh token".to_string(),
            });
            return Err(LifecycleError::NoRefreshToken(key.clone()));
        };

        let response = match self.client.refresh(key, refresh_token).await {
            Ok(response) => response,
            Err(err) => return Err(self.on_refresh_failure(key, err).await),
        };

        let now = Utc::now();
        let next = match current.refreshed(response, now) {
            Ok(next) => next,
            Err(err) => return Err(self.on_refresh_failure(key, err).await),
        };
        let evict_at = self.evict_at(&next, now);
        let record = self.encrypt(&next, evict_at)?;

        let generation = self.cache.generation();
        match self
            .repository
            .compare_and_swap(&record, current.refresh_count)
            .await?
        {
            CasOutcome::Updated => {
                self.cache
                    .insert_if_current(next.clone(), evict_at, generation)
                    .await;
                self.scheduler.clear_intervention(key);
                info!(
                    "Refreshed token for {} ({:?}, refresh #{})",
                    key, trigger, next.refresh_count
                );
                self.events.emit(LifecycleEvent::Refreshed {
                    key: key.clone(),
                    refresh_count: next.refresh_count,
                    expires_at: next.expires_at,
                    trigger,
                });
                self.arm_next_cycle(&next, true);
                Ok(RefreshOutcome::Refreshed(next))
            }
            CasOutcome::Missing => {
                warn!("Token for {} was removed during refresh; discarding result", key);
                self.cache.invalidate(key).await;
                Err(LifecycleError::TokenNotFound(key.clone()))
            }
            CasOutcome::Conflict => {
                warn!("Token for {} changed during refresh; keeping stored version", key);
                self.cache.invalidate(key).await;
                self.load_uncached(key)
                    .await?
                    .map(RefreshOutcome::AlreadyFresh)
                    .ok_or_else(|| LifecycleError::TokenNotFound(key.clone()))
            }
        }
    }

    async fn on_refresh_failure(&self, key: &TokenKey, err: LifecycleError) -> LifecycleError {
        match &err {
            LifecycleError::RefreshTokenInvalid { reason, .. } => {
                warn!("Refresh token for {} rejected ({}); removing token", key, reason);
                self.events.emit(LifecycleEvent::RefreshFailed {
                    key: key.clone(),
                    reason: RefreshFailureReason::RefreshTokenInvalid,
                    terminal: true,
                    message: reason.clone(),
                });
                if let Err(e) = self.remove(key).await {
                    error!("Failed to remove rejected token {}: {}", key, e);
                }
            }
            LifecycleError::ProviderRejected(message)
            | LifecycleError::ProviderNotConfigured(message) => {
                error!("Provider rejected refresh for {}: {}", key, message);
                self.scheduler.mark_intervention(key);
                self.events.emit(LifecycleEvent::RefreshFailed {
                    key: key.clone(),
                    reason: RefreshFailureReason::ProviderRejected,
                    terminal: true,
                    message: message.clone(),
                });
            }
            _ => warn!("Refresh for {} failed: {}", key, err),
        }
        err
    }

    /// Arm a backstop job when a near-expiry token has nothing scheduled
    fn ensure_backstop(&self, token: &OAuthToken, now: DateTime<Utc>) {
        let threshold = i64::try_from(self.config.refresh_threshold_ms).unwrap_or(i64::MAX);
        if self.config.enable_auto_refresh
            && token.can_refresh()
            && token.ms_until_expiry(now) <= threshold
            && self.scheduler.job_state(&token.key()) == JobState::Idle
        {
            self.scheduler.schedule(&token.snapshot(), false);
        }
    }

    fn arm_next_cycle(&self, token: &OAuthToken, after_refresh: bool) {
        if !self.config.enable_auto_refresh {
            return;
        }
        let proactive = self.config.proactive_refresh_enabled;
        if after_refresh {
            self.scheduler.reschedule_after_refresh(
                &token.snapshot(),
                proactive,
                token.expires_at - token.issued_at,
            );
        } else {
            self.scheduler.reschedule(&token.snapshot(), proactive);
        }
    }

    async fn load_uncached(&self, key: &TokenKey) -> LifecycleResult<Option<OAuthToken>> {
        self.repository
            .fetch(key, Utc::now())
            .await?
            .map(|record| self.decrypt(&record))
            .transpose()
    }

    /// Records outlive expiry by at least the minimum storage TTL
    fn evict_at(&self, token: &OAuthToken, now: DateTime<Utc>) -> DateTime<Utc> {
        let min_ttl =
            Duration::milliseconds(i64::try_from(self.config.min_storage_ttl_ms).unwrap_or(i64::MAX));
        token.expires_at.max(now + min_ttl)
    }

    fn encrypt(&self, token: &OAuthToken, evict_at: DateTime<Utc>) -> LifecycleResult<TokenRecord> {
        Ok(TokenRecord {
            provider: token.provider.clone(),
            user_id: token.user_id.clone(),
            access_token: self.cipher.encrypt(&token.access_token)?,
            refresh_token: token
                .refresh_token
                .as_deref()
                .map(|t| self.cipher.encrypt(t))
                .transpose()?,
            token_type: token.token_type.clone(),
            scope: token.scope.iter().cloned().collect(),
            issued_at: token.issued_at,
            expires_at: token.expires_at,
            last_refreshed_at: token.last_refreshed_at,
            refresh_count: token.refresh_count,
            provider_metadata: token.provider_metadata.clone(),
            evict_at,
        })
    }

    fn decrypt(&self, record: &TokenRecord) -> LifecycleResult<OAuthToken> {
        Ok(OAuthToken {
            provider: record.provider.clone(),
            user_id: record.user_id.clone(),
            access_token: self.cipher.decrypt(&record.access_token)?,
            refresh_token: record
                .refresh_token
                .as_ref()
                .map(|blob| self.cipher.decrypt(blob))
                .transpose()?,
            token_type: record.token_type.clone(),
            scope: record.scope.iter().cloned().collect(),
            issued_at: record.issued_at,
            expires_at: record.expires_at,
            last_refreshed_at: record.last_refreshed_at,
            refresh_count: record.refresh_count,
            provider_metadata: record.provider_metadata.clone(),
        })
    }
}

fn same_version(current: &OAuthToken, seen: &OAuthToken) -> bool {
    current.refresh_count == seen.refresh_count
        && current.issued_at.timestamp_millis() == seen.issued_at.timestamp_millis()
        && current.expires_at.timestamp_millis() == seen.expires_at.timestamp_millis()
        && current.access_token == seen.access_token
}

#[async_trait]
impl JobHandler for TokenStore {
    async fn process(&self, job: &RefreshJob) -> JobOutcome {
        let current = match self.repository.fetch(&job.key, Utc::now()).await {
            Ok(Some(record)) => TokenSnapshot::from(&record),
            Ok(None) => {
                debug!("Skipping refresh job {}: token for {} is gone", job.id, job.key);
                return JobOutcome::Skipped;
            }
            Err(e) => return JobOutcome::Transient(e.to_string()),
        };
        if job.is_stale_for(&current) {
            debug!("Skipping stale refresh job {} for {}", job.id, job.key);
            return JobOutcome::Skipped;
        }

        match self
            .refresh_with(&job.key, Some(job.observed_refresh_count), job.trigger())
            .await
        {
            Ok(RefreshOutcome::Refreshed(_)) => JobOutcome::Completed,
            Ok(RefreshOutcome::AlreadyFresh(_)) | Err(LifecycleError::TokenNotFound(_)) => {
                JobOutcome::Skipped
            }
            Err(e) if e.is_transient() => JobOutcome::Transient(e.to_string()),
            Err(_) => JobOutcome::Terminal,
        }
    }
}
