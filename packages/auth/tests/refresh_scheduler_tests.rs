// ABOUTME: Integration tests for background refresh scheduling
// ABOUTME: Tests proactive and backstop refreshes, retry exhaustion, removal races, and rehydration

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use warden_auth::oauth::{JobState, LifecycleEvent, LifecycleManager, RefreshFailureReason, RefreshTrigger, TokenSpec};
use warden_config::LifecycleConfig;
use warden_core::TokenKey;
use warden_storage::TokenRepository;

use common::*;

#[tokio::test]
async fn test_proactive_refresh_before_expiry() {
    let h = harness(test_config()).await;
    mount_refresh_success(&h.server, "proactive-access", 1).await;

    h.manager.start().await.unwrap();
    let mut rx = h.manager.subscribe();
    // Already inside the 60s threshold, so the job is due immediately
    let key = h
        .manager
        .store_token(refreshable_spec("alice", 60))
        .await
        .unwrap();

    match next_event(&mut rx, |e| matches!(e, LifecycleEvent::Refreshed { .. })).await {
        LifecycleEvent::Refreshed {
            key: refreshed,
            refresh_count,
            trigger,
            ..
        } => {
            assert_eq!(refreshed, key);
            assert_eq!(refresh_count, 1);
            assert_eq!(trigger, RefreshTrigger::Proactive);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // The next cycle is armed against the refreshed token
    let manager = h.manager.clone();
    let watched = key.clone();
    wait_until(move || {
        manager
            .pending_job(&watched)
            .map(|job| job.observed_refresh_count == 1)
            .unwrap_or(false)
    })
    .await;
    let job = h.manager.pending_job(&key).unwrap();
    assert!(job.proactive);
    assert_eq!(job.attempt, 1);
    assert_eq!(h.manager.job_state(&key), JobState::Scheduled);

    let token = h.manager.get_token(PROVIDER, "alice").await.unwrap().unwrap();
    assert_eq!(token.access_token, "proactive-access");
    assert_eq!(token.refresh_count, 1);
}

#[tokio::test]
async fn test_backstop_refresh_when_proactive_disabled() {
    let config = LifecycleConfig {
        proactive_refresh_enabled: false,
        ..test_config()
    };
    let h = harness(config).await;
    mount_refresh_success(&h.server, "backstop-access", 1).await;

    h.manager.start().await.unwrap();
    let mut rx = h.manager.subscribe();
    let key = h
        .manager
        .store_token(refreshable_spec("alice", 60))
        .await
        .unwrap();

    match next_event(&mut rx, |e| matches!(e, LifecycleEvent::Refreshed { .. })).await {
        LifecycleEvent::Refreshed { trigger, .. } => {
            assert_eq!(trigger, RefreshTrigger::Backstop)
        }
        other => panic!("unexpected event {:?}", other),
    }

    let manager = h.manager.clone();
    let watched = key.clone();
    wait_until(move || {
        manager
            .pending_job(&watched)
            .map(|job| job.observed_refresh_count == 1)
            .unwrap_or(false)
    })
    .await;
    assert!(!h.manager.pending_job(&key).unwrap().proactive);
}

#[tokio::test]
async fn test_transient_failures_exhaust_retries() {
    let h = harness(test_config()).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&h.server)
        .await;

    h.manager.start().await.unwrap();
    let mut rx = h.manager.subscribe();
    let key = h
        .manager
        .store_token(refreshable_spec("alice", 60))
        .await
        .unwrap();

    match next_event(&mut rx, |e| matches!(e, LifecycleEvent::RefreshFailed { .. })).await {
        LifecycleEvent::RefreshFailed {
            reason, terminal, ..
        } => {
            assert_eq!(reason, RefreshFailureReason::RetriesExhausted);
            assert!(!terminal);
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert!(h.manager.needs_intervention(&key));
    assert_eq!(h.manager.job_state(&key), JobState::Exhausted);
    assert!(h.manager.pending_job(&key).is_none());
    // The token stays; an operator decides what happens next
    assert_eq!(h.manager.list_tokens().await.unwrap().len(), 1);
    assert!(h.manager.get_token(PROVIDER, "alice").await.unwrap().is_some());

    // No automatic attempts after exhaustion
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.server.verify().await;

    // A successful manual refresh clears the flag and re-arms the cycle
    h.server.reset().await;
    mount_refresh_success(&h.server, "recovered", 1).await;
    let token = h.manager.refresh_token(&key).await.unwrap();
    assert_eq!(token.access_token, "recovered");
    assert!(!h.manager.needs_intervention(&key));
    assert!(h.manager.pending_job(&key).is_some());
}

#[tokio::test]
async fn test_provider_rejection_stops_retries() {
    let h = harness(test_config()).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "invalid_client"
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    h.manager.start().await.unwrap();
    let mut rx = h.manager.subscribe();
    let key = h
        .manager
        .store_token(refreshable_spec("alice", 60))
        .await
        .unwrap();

    match next_event(&mut rx, |e| matches!(e, LifecycleEvent::RefreshFailed { .. })).await {
        LifecycleEvent::RefreshFailed {
            reason, terminal, ..
        } => {
            assert_eq!(reason, RefreshFailureReason::ProviderRejected);
            assert!(terminal);
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert!(h.manager.needs_intervention(&key));
    assert_eq!(h.manager.list_tokens().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_remove_during_scheduled_refresh() {
    let h = harness(test_config()).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "discarded", "expires_in": 3600}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&h.server)
        .await;

    h.manager.start().await.unwrap();
    let key = h
        .manager
        .store_token(refreshable_spec("alice", 60))
        .await
        .unwrap();

    let manager = h.manager.clone();
    let watched = key.clone();
    wait_until(move || manager.job_state(&watched) == JobState::Running).await;

    assert!(h.manager.remove_token(PROVIDER, "alice").await.unwrap());

    let manager = h.manager.clone();
    let watched = key.clone();
    wait_until(move || manager.job_state(&watched) == JobState::Idle).await;

    assert!(h.manager.get_token(PROVIDER, "alice").await.unwrap().is_none());
    assert!(h
        .repository
        .fetch(&key, chrono::Utc::now())
        .await
        .unwrap()
        .is_none());
    assert!(h.manager.pending_job(&key).is_none());
}

#[tokio::test]
async fn test_restore_replaces_pending_job() {
    let h = harness(test_config()).await;
    let key = h
        .manager
        .store_token(refreshable_spec("alice", 3600))
        .await
        .unwrap();
    let first = h.manager.pending_job(&key).unwrap();

    h.manager
        .store_token(refreshable_spec("alice", 7200))
        .await
        .unwrap();
    let second = h.manager.pending_job(&key).unwrap();

    assert_ne!(first.id, second.id);
    assert!(second.scheduled_at > first.scheduled_at);
}

#[tokio::test]
async fn test_tokens_without_refresh_token_are_not_scheduled() {
    let h = harness(test_config()).await;
    let key = h
        .manager
        .store_token(TokenSpec::new(PROVIDER, "alice", "at").with_expires_in(60))
        .await
        .unwrap();
    assert!(h.manager.pending_job(&key).is_none());
    assert_eq!(h.manager.job_state(&key), JobState::Idle);
}

#[tokio::test]
async fn test_auto_refresh_disabled() {
    let config = LifecycleConfig {
        enable_auto_refresh: false,
        ..test_config()
    };
    let h = harness(config).await;
    mount_refresh_success(&h.server, "unused", 0).await;

    assert_eq!(h.manager.start().await.unwrap(), 0);
    let key = h
        .manager
        .store_token(refreshable_spec("alice", 60))
        .await
        .unwrap();
    assert!(h.manager.pending_job(&key).is_none());

    h.manager
        .store_token(expired_spec("bob", 5, true))
        .await
        .unwrap();
    // Expired but refreshable: not served, not deleted
    assert!(h.manager.get_token(PROVIDER, "bob").await.unwrap().is_none());
    assert_eq!(h.manager.list_tokens().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_short_lived_provider_tokens_do_not_spin() {
    let config = LifecycleConfig {
        min_refresh_interval_ms: 200,
        ..test_config()
    };
    let h = harness(config).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "instantly-stale",
            "expires_in": 0
        })))
        .mount(&h.server)
        .await;

    h.manager.start().await.unwrap();
    let key = h
        .manager
        .store_token(refreshable_spec("dave", 30))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let calls = h.server.received_requests().await.unwrap().len();
    assert!((1..=4).contains(&calls), "token endpoint called {} times", calls);
    let tokens = h.manager.list_tokens().await.unwrap();
    assert_eq!(tokens[0].key, key);
    assert!(tokens[0].refresh_count >= 1);
    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_start_rehydrates_jobs_from_storage() {
    let server = wiremock::MockServer::start().await;
    let repository = test_repository().await;

    let first = LifecycleManager::new(
        test_config(),
        registry_for(&server),
        test_cipher(),
        repository.clone() as Arc<dyn TokenRepository>,
    )
    .unwrap();
    first
        .store_token(refreshable_spec("alice", 3600))
        .await
        .unwrap();
    first
        .store_token(refreshable_spec("bob", 7200))
        .await
        .unwrap();
    first
        .store_token(TokenSpec::new(PROVIDER, "carol", "at").with_expires_in(3600))
        .await
        .unwrap();
    drop(first);

    // A fresh process over the same database
    let second = LifecycleManager::new(
        test_config(),
        registry_for(&server),
        test_cipher(),
        repository.clone() as Arc<dyn TokenRepository>,
    )
    .unwrap();
    assert_eq!(second.start().await.unwrap(), 2);
    assert!(second.pending_job(&TokenKey::new(PROVIDER, "alice")).is_some());
    assert!(second.pending_job(&TokenKey::new(PROVIDER, "bob")).is_some());
    assert!(second.pending_job(&TokenKey::new(PROVIDER, "carol")).is_none());

    // Starting twice arms nothing new
    assert_eq!(second.start().await.unwrap(), 0);

    let token = second.get_token(PROVIDER, "alice").await.unwrap().unwrap();
    assert_eq!(token.access_token, "access-alice");

    second.shutdown().await;
}
