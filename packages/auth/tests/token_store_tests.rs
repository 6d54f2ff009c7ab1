// ABOUTME: Integration tests for the token store and its refresh job handler
// ABOUTME: Tests stale-job detection, single-flight outcomes, and failure classification

mod common;

use std::sync::Arc;

use chrono::Utc;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use warden_auth::oauth::{
    EventBus, JobHandler, JobOutcome, LifecycleEvent, OAuthToken, ProviderClient, RefreshOutcome,
    RefreshScheduler, RefreshTrigger, TokenStore,
};
use warden_auth::LifecycleError;
use warden_storage::TokenRepository;

use common::*;

struct StoreFixture {
    store: TokenStore,
    events: EventBus,
    repository: Arc<warden_storage::SqliteTokenRepository>,
    server: MockServer,
}

async fn fixture() -> StoreFixture {
    let server = MockServer::start().await;
    let repository = test_repository().await;
    let config = test_config();
    let events = EventBus::new(config.event_channel_size);
    let client = ProviderClient::new(Arc::new(registry_for(&server)), config.http_timeout()).unwrap();
    let scheduler = Arc::new(RefreshScheduler::new(
        config.clone(),
        events.clone(),
        CancellationToken::new(),
    ));
    let store = TokenStore::new(
        config,
        repository.clone() as Arc<dyn TokenRepository>,
        Arc::new(test_cipher()),
        client,
        scheduler,
        events.clone(),
    );

    StoreFixture {
        store,
        events,
        repository,
        server,
    }
}

fn token(user: &str, expires_in: i64) -> OAuthToken {
    OAuthToken::from_spec(refreshable_spec(user, expires_in), Utc::now()).unwrap()
}

#[tokio::test]
async fn test_store_emits_event_and_arms_job() {
    let f = fixture().await;
    let mut rx = f.events.subscribe();
    let token = token("alice", 3600);

    f.store.store(&token).await.unwrap();

    match next_event(&mut rx, |e| matches!(e, LifecycleEvent::Stored { .. })).await {
        LifecycleEvent::Stored { key, expires_at } => {
            assert_eq!(key, token.key());
            assert_eq!(expires_at, token.expires_at);
        }
        other => panic!("unexpected event {:?}", other),
    }
    let job = f.store.scheduler().pending_job(&token.key()).unwrap();
    assert_eq!(job.observed_refresh_count, 0);
    assert_eq!(job.observed_expires_at, token.expires_at);
}

#[tokio::test]
async fn test_load_matches_stored_token() {
    let f = fixture().await;
    let token = token("alice", 3600);
    f.store.store(&token).await.unwrap();

    assert_eq!(f.store.load(&token.key()).await.unwrap(), Some(token.clone()));

    let snapshots = f.store.list().await.unwrap();
    assert_eq!(snapshots, vec![token.snapshot()]);
}

#[tokio::test]
async fn test_stale_job_is_skipped() {
    let f = fixture().await;
    mount_refresh_success(&f.server, "never", 0).await;

    let original = token("alice", 3600);
    f.store.store(&original).await.unwrap();
    let job = f.store.scheduler().pending_job(&original.key()).unwrap();

    // Re-stored with a new expiry after the job was scheduled
    f.store.store(&token("alice", 7200)).await.unwrap();

    assert_eq!(f.store.process(&job).await, JobOutcome::Skipped);
}

#[tokio::test]
async fn test_job_for_removed_token_is_skipped() {
    let f = fixture().await;
    mount_refresh_success(&f.server, "never", 0).await;

    let token = token("alice", 3600);
    f.store.store(&token).await.unwrap();
    let job = f.store.scheduler().pending_job(&token.key()).unwrap();
    assert!(f.store.remove(&token.key()).await.unwrap());

    assert_eq!(f.store.process(&job).await, JobOutcome::Skipped);
    assert!(f.store.scheduler().pending_job(&token.key()).is_none());
}

#[tokio::test]
async fn test_current_job_completes() {
    let f = fixture().await;
    mount_refresh_success(&f.server, "from-job", 1).await;

    let token = token("alice", 30);
    f.store.store(&token).await.unwrap();
    let job = f.store.scheduler().pending_job(&token.key()).unwrap();

    assert_eq!(f.store.process(&job).await, JobOutcome::Completed);
    let refreshed = f.store.load(&token.key()).await.unwrap().unwrap();
    assert_eq!(refreshed.access_token, "from-job");
    assert_eq!(refreshed.refresh_count, 1);

    // Replayed job is now stale
    assert_eq!(f.store.process(&job).await, JobOutcome::Skipped);
}

#[tokio::test]
async fn test_observed_count_short_circuits_refresh() {
    let f = fixture().await;
    mount_refresh_success(&f.server, "once", 1).await;

    let token = token("alice", 3600);
    f.store.store(&token).await.unwrap();
    let key = token.key();

    let first = f
        .store
        .refresh_with(&key, Some(0), RefreshTrigger::Reactive)
        .await
        .unwrap();
    assert!(matches!(first, RefreshOutcome::Refreshed(_)));

    // A caller that read the token before the refresh gets the stored result
    let second = f
        .store
        .refresh_with(&key, Some(0), RefreshTrigger::Reactive)
        .await
        .unwrap();
    match second {
        RefreshOutcome::AlreadyFresh(token) => {
            assert_eq!(token.access_token, "once");
            assert_eq!(token.refresh_count, 1);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_transient_failure_reported_to_scheduler() {
    let f = fixture().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&f.server)
        .await;

    let token = token("alice", 30);
    f.store.store(&token).await.unwrap();
    let job = f.store.scheduler().pending_job(&token.key()).unwrap();

    assert!(matches!(f.store.process(&job).await, JobOutcome::Transient(_)));
    assert!(f.store.load(&token.key()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_dead_grant_is_terminal_for_scheduler() {
    let f = fixture().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "invalid_grant"})),
        )
        .expect(1)
        .mount(&f.server)
        .await;

    let token = token("alice", 30);
    f.store.store(&token).await.unwrap();
    let job = f.store.scheduler().pending_job(&token.key()).unwrap();

    assert_eq!(f.store.process(&job).await, JobOutcome::Terminal);
    assert!(f
        .repository
        .fetch(&token.key(), Utc::now())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_refresh_unknown_key() {
    let f = fixture().await;
    let err = f
        .store
        .refresh(&warden_core::TokenKey::new(PROVIDER, "nobody"))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::TokenNotFound(_)));
}

#[tokio::test]
async fn test_remove_if_unchanged_spares_a_newer_version() {
    let f = fixture().await;
    let original = token("alice", 3600);
    f.store.store(&original).await.unwrap();
    let newer = OAuthToken {
        access_token: "replacement".to_string(),
        ..token("alice", 7200)
    };
    f.store.store(&newer).await.unwrap();

    assert!(!f
        .store
        .remove_if_unchanged(&original.key(), &original)
        .await
        .unwrap());
    let stored = f.store.load(&original.key()).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "replacement");

    assert!(f.store.remove_if_unchanged(&newer.key(), &stored).await.unwrap());
    assert!(f.store.load(&newer.key()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_purge_evicted_leaves_live_records() {
    let f = fixture().await;
    f.store.store(&token("alice", 3600)).await.unwrap();
    assert_eq!(f.store.purge_evicted().await.unwrap(), 0);
    assert_eq!(f.store.list().await.unwrap().len(), 1);
}
