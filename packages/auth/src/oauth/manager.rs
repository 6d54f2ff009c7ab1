// ABOUTME: Lifecycle manager façade tying together store, scheduler, health, and metrics
// ABOUTME: Entry point for storing, reading, refreshing, revoking, and observing OAuth tokens

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use warden_config::LifecycleConfig;
use warden_core::TokenKey;
use warden_security::TokenCipher;
use warden_storage::{SqliteTokenRepository, TokenRepository};

use crate::error::{LifecycleError, LifecycleResult};
use crate::oauth::client::{Introspection, ProviderClient, TokenTypeHint};
use crate::oauth::events::{EventBus, LifecycleEvent};
use crate::oauth::health::{HealthMonitor, HealthStatus, HealthSweepReport};
use crate::oauth::metrics::{MetricsAggregator, TokenMetrics};
use crate::oauth::provider::ProviderRegistry;
use crate::oauth::scheduler::{JobHandler, JobState, RefreshJob, RefreshScheduler};
use crate::oauth::store::TokenStore;
use crate::oauth::types::{OAuthToken, TokenSnapshot, TokenSpec};

/// Token lifecycle manager
///
/// Build once, share behind an `Arc`, call [`start`](Self::start) to launch
/// the refresh dispatcher and the health and metrics timers, and
/// [`shutdown`](Self::shutdown) before exit.
pub struct LifecycleManager {
    config: LifecycleConfig,
    registry: Arc<ProviderRegistry>,
    store: Arc<TokenStore>,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsAggregator>,
    events: EventBus,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
}

impl LifecycleManager {
    /// Assemble a manager from already-built parts
    pub fn new(
        config: LifecycleConfig,
        registry: ProviderRegistry,
        cipher: TokenCipher,
        repository: Arc<dyn TokenRepository>,
    ) -> LifecycleResult<Self> {
        config.validate()?;
        if registry.is_empty() {
            warn!("No OAuth providers configured; tokens cannot be stored");
        }

        let registry = Arc::new(registry);
        let events = EventBus::new(config.event_channel_size);
        let shutdown = CancellationToken::new();
        let client = ProviderClient::new(Arc::clone(&registry), config.http_timeout())?;
        let scheduler = Arc::new(RefreshScheduler::new(
            config.clone(),
            events.clone(),
            shutdown.child_token(),
        ));
        let store = Arc::new(TokenStore::new(
            config.clone(),
            repository,
            Arc::new(cipher),
            client,
            scheduler,
            events.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&store),
            events.clone(),
            config.clone(),
        ));
        let metrics = Arc::new(MetricsAggregator::new(Arc::clone(&store), config.clone()));

        Ok(Self {
            config,
            registry,
            store,
            health,
            metrics,
            events,
            shutdown,
            tasks: TaskTracker::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Open the configured database and derive the cipher from the environment
    pub async fn connect(config: LifecycleConfig, registry: ProviderRegistry) -> LifecycleResult<Self> {
        let cipher = TokenCipher::from_env(&config.encryption_key_var)?;
        let pool = warden_storage::connect(&config.database_url).await?;
        let repository: Arc<dyn TokenRepository> = Arc::new(SqliteTokenRepository::new(pool));
        Self::new(config, registry, cipher, repository)
    }

    /// Load configuration and providers from WARDEN_* variables, then connect
    pub async fn from_env() -> LifecycleResult<Self> {
        let config = LifecycleConfig::from_env()?;
        let registry = ProviderRegistry::from_env()?;
        Self::connect(config, registry).await
    }

    /// Launch background work and arm refreshes for stored tokens
    ///
    /// Returns how many refresh jobs were armed. Calling it twice is a no-op.
    pub async fn start(&self) -> LifecycleResult<usize> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Lifecycle manager already started");
            return Ok(0);
        }

        let scheduler = self.store.scheduler();
        let handler: Arc<dyn JobHandler> = Arc::clone(&self.store) as Arc<dyn JobHandler>;
        scheduler.start(Arc::downgrade(&handler));

        let armed = if self.config.enable_auto_refresh {
            scheduler.rehydrate(self.store.list().await?)
        } else {
            info!("Auto-refresh disabled; no refresh jobs armed");
            0
        };

        self.tasks.spawn(
            Arc::clone(&self.health).run(self.shutdown.child_token()),
        );
        self.tasks.spawn(
            Arc::clone(&self.metrics).run(self.shutdown.child_token()),
        );

        info!(
            "Lifecycle manager started ({} providers, {} refresh jobs armed)",
            self.registry.len(),
            armed
        );
        Ok(armed)
    }

    /// Stop timers and the dispatcher, wait for running refreshes, close storage
    pub async fn shutdown(&self) {
        info!("Shutting down lifecycle manager");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.store.scheduler().shutdown().await;
        self.store.close().await;
        info!("Lifecycle manager stopped");
    }

    /// Encrypt and persist a token, arming its first refresh
    pub async fn store_token(&self, mut spec: TokenSpec) -> LifecycleResult<TokenKey> {
        let provider = self.registry.get(&spec.provider)?;
        if spec.user_id.trim().is_empty() {
            return Err(LifecycleError::InvalidToken("user id is empty".to_string()));
        }
        if spec.access_token.is_empty() {
            return Err(LifecycleError::InvalidToken(
                "access token is empty".to_string(),
            ));
        }
        if matches!(spec.expires_in, Some(secs) if secs <= 0) {
            return Err(LifecycleError::InvalidToken(
                "expires_in must be positive".to_string(),
            ));
        }
        if spec.scope.is_empty() {
            spec.scope = provider.scopes.clone();
        }

        let token = OAuthToken::from_spec(spec, Utc::now())?;
        self.store.store(&token).await?;
        Ok(token.key())
    }

    /// A usable token, or `None` if there is none or it cannot be made usable
    ///
    /// Refresh failures are logged and reported through events rather than
    /// returned. Storage and decryption failures still surface as errors.
    pub async fn get_token(&self, provider: &str, user_id: &str) -> LifecycleResult<Option<OAuthToken>> {
        let key = TokenKey::new(provider, user_id);
        match self.store.get(&key).await {
            Ok(token) => Ok(token),
            Err(e @ (LifecycleError::StorageUnavailable(_) | LifecycleError::Encryption(_))) => Err(e),
            Err(e) => {
                warn!("Token for {} is not usable: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Refresh now, regardless of expiry
    pub async fn refresh_token(&self, key: &TokenKey) -> LifecycleResult<OAuthToken> {
        info!("Manual refresh requested for {}", key);
        self.store.refresh(key).await
    }

    /// Revoke at the provider when it supports revocation, then remove locally
    ///
    /// A failed remote revocation leaves the token in place.
    pub async fn revoke_token(&self, provider: &str, user_id: &str) -> LifecycleResult<()> {
        let key = TokenKey::new(provider, user_id);
        let token = self
            .store
            .load(&key)
            .await?
            .ok_or_else(|| LifecycleError::TokenNotFound(key.clone()))?;

        let (secret, hint) = match token.refresh_token.as_deref() {
            Some(refresh_token) => (refresh_token, TokenTypeHint::RefreshToken),
            None => (token.access_token.as_str(), TokenTypeHint::AccessToken),
        };
        let remote = self.client().revoke(&key.provider, secret, hint).await?;

        self.store.remove(&key).await?;
        info!("Revoked token for {} (remote: {})", key, remote);
        self.events.emit(LifecycleEvent::Revoked { key, remote });
        Ok(())
    }

    /// Forget a token locally; unknown keys are a no-op
    pub async fn remove_token(&self, provider: &str, user_id: &str) -> LifecycleResult<bool> {
        self.store.remove(&TokenKey::new(provider, user_id)).await
    }

    /// Health of a stored token without refreshing it
    pub async fn get_token_health(
        &self,
        provider: &str,
        user_id: &str,
    ) -> LifecycleResult<Option<HealthStatus>> {
        let key = TokenKey::new(provider, user_id);
        let now = Utc::now();
        Ok(self
            .store
            .load(&key)
            .await?
            .map(|token| self.health.status(&token.snapshot(), now)))
    }

    /// Latest metrics snapshot, collected on demand before the first interval
    pub async fn get_metrics(&self) -> LifecycleResult<TokenMetrics> {
        self.metrics.get_metrics().await
    }

    /// Collect a fresh metrics snapshot now
    pub async fn collect_metrics(&self) -> LifecycleResult<TokenMetrics> {
        self.metrics.collect().await
    }

    /// Run one health sweep now
    pub async fn sweep_health(&self) -> LifecycleResult<HealthSweepReport> {
        self.health.sweep().await
    }

    /// Ask the provider whether the stored access token is still active
    pub async fn introspect_token(&self, provider: &str, user_id: &str) -> LifecycleResult<Introspection> {
        let key = TokenKey::new(provider, user_id);
        let token = self
            .store
            .load(&key)
            .await?
            .ok_or_else(|| LifecycleError::TokenNotFound(key.clone()))?;
        self.client()
            .introspect(&key.provider, &token.access_token)
            .await
    }

    /// Secret-free listing of stored tokens
    pub async fn list_tokens(&self) -> LifecycleResult<Vec<TokenSnapshot>> {
        self.store.list().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn job_state(&self, key: &TokenKey) -> JobState {
        self.scheduler().job_state(key)
    }

    pub fn pending_job(&self, key: &TokenKey) -> Option<RefreshJob> {
        self.scheduler().pending_job(key)
    }

    /// Whether automatic refresh gave up on this token
    pub fn needs_intervention(&self, key: &TokenKey) -> bool {
        self.scheduler().needs_intervention(key)
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn scheduler(&self) -> &RefreshScheduler {
        self.store.scheduler()
    }

    fn client(&self) -> &ProviderClient {
        self.store.client()
    }
}
