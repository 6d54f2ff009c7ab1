// ABOUTME: Shared fixtures for lifecycle integration tests
// ABOUTME: Fast cipher, in-memory repository, and a provider registry pointed at a mock server

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use warden_auth::oauth::{LifecycleEvent, LifecycleManager, ProviderConfig, ProviderRegistry, TokenSpec};
use warden_config::LifecycleConfig;
use warden_security::{KdfParams, TokenCipher};
use warden_storage::{connect, SqliteTokenRepository, TokenRepository};

pub const PROVIDER: &str = "acme";
pub const SECRET: &str = "integration-test-secret-0123456789";

/// Cheap Argon2 parameters so tests don't spend seconds deriving keys
pub fn test_cipher() -> TokenCipher {
    TokenCipher::from_secret_with_params(
        SECRET,
        KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        },
    )
    .unwrap()
}

pub fn test_config() -> LifecycleConfig {
    LifecycleConfig {
        database_url: "sqlite::memory:".to_string(),
        refresh_threshold_ms: 60_000,
        refresh_jitter_ms: 0,
        refresh_retry_delay_ms: 20,
        max_refresh_attempts: 3,
        http_timeout_ms: 2_000,
        health_check_interval_ms: 3_600_000,
        metrics_interval_ms: 3_600_000,
        ..LifecycleConfig::default()
    }
}

pub async fn test_repository() -> Arc<SqliteTokenRepository> {
    let pool = connect("sqlite::memory:").await.unwrap();
    Arc::new(SqliteTokenRepository::new(pool))
}

pub fn registry_for(server: &MockServer) -> ProviderRegistry {
    ProviderRegistry::new([ProviderConfig::new(
        PROVIDER,
        "client-id",
        format!("{}/token", server.uri()),
    )
    .with_client_secret("client-secret")
    .with_revoke_url(format!("{}/revoke", server.uri()))
    .with_introspect_url(format!("{}/introspect", server.uri()))
    .with_scopes(["profile"])])
    .unwrap()
}

pub struct Harness {
    pub manager: Arc<LifecycleManager>,
    pub repository: Arc<SqliteTokenRepository>,
    pub server: MockServer,
}

pub async fn harness(config: LifecycleConfig) -> Harness {
    let server = MockServer::start().await;
    let repository = test_repository().await;
    let manager = LifecycleManager::new(
        config,
        registry_for(&server),
        test_cipher(),
        repository.clone() as Arc<dyn TokenRepository>,
    )
    .unwrap();

    Harness {
        manager: Arc::new(manager),
        repository,
        server,
    }
}

/// Token with a refresh token, expiring `expires_in` seconds from now
pub fn refreshable_spec(user: &str, expires_in: i64) -> TokenSpec {
    TokenSpec::new(PROVIDER, user, format!("access-{}", user))
        .with_refresh_token(format!("refresh-{}", user))
        .with_scope(["read", "write"])
        .with_expires_in(expires_in)
}

/// Token that expired `ago_secs` seconds ago
pub fn expired_spec(user: &str, ago_secs: i64, with_refresh_token: bool) -> TokenSpec {
    let mut spec = TokenSpec::new(PROVIDER, user, format!("access-{}", user));
    if with_refresh_token {
        spec = spec.with_refresh_token(format!("refresh-{}", user));
    }
    spec.expires_at = Some(Utc::now() - chrono::Duration::seconds(ago_secs));
    spec
}

pub async fn mount_refresh_success(server: &MockServer, access_token: &str, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": access_token,
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

/// Wait for the first event matching `predicate`
pub async fn next_event<F>(rx: &mut broadcast::Receiver<LifecycleEvent>, predicate: F) -> LifecycleEvent
where
    F: Fn(&LifecycleEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received in time")
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
