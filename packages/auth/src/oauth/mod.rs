// ABOUTME: OAuth token lifecycle module
// ABOUTME: Provider registry and client, encrypted store, refresh scheduler, health, metrics, and events

pub mod cache;
pub mod client;
pub mod events;
pub mod health;
pub mod locks;
pub mod manager;
pub mod metrics;
pub mod provider;
pub mod scheduler;
pub mod store;
pub mod types;

pub use client::{Introspection, ProviderClient, TokenTypeHint};
pub use events::{EventBus, LifecycleEvent, RefreshFailureReason, RefreshTrigger};
pub use health::{score, HealthMonitor, HealthPolicy, HealthStatus, HealthSweepReport, RiskLevel};
pub use manager::LifecycleManager;
pub use metrics::{MetricsAggregator, ProviderMetrics, TokenMetrics};
pub use provider::{KnownProvider, ProviderConfig, ProviderRegistry};
pub use scheduler::{compute_refresh_delay, JobHandler, JobOutcome, JobState, RefreshJob, RefreshScheduler};
pub use store::{RefreshOutcome, TokenStore};
pub use types::{OAuthToken, TokenResponse, TokenSnapshot, TokenSpec};
