//! Engagement metrics refresh for items and accounts

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{generous_limits, of_type, Harness, BRAND};
use libsyndicast::handlers::{refresh_metrics, MetricsOutcome};
use libsyndicast::jobs::MetricsJob;
use libsyndicast::platforms::mock::{MockAdapter, MockConfig};
use libsyndicast::realtime::EventType;
use libsyndicast::{Platform, SyndicastError};

#[tokio::test]
async fn test_account_batch_isolates_one_failing_item() {
    let h = Harness::new().await;
    let instagram = Arc::new(MockAdapter::new(MockConfig {
        failing_metrics: HashSet::from(["ig-post-3".to_string()]),
        ..MockConfig::for_platform(Platform::Instagram)
    }));
    let ctx = h.context(vec![instagram.clone()]);
    let mut events = h.subscribe();

    let account = h.account(Platform::Instagram, "ig-1").await;
    let post = h.post().await;
    let mut items = Vec::new();
    for n in 1..=5 {
        items.push(h.published_item(&post, &account, &format!("ig-post-{}", n)).await);
    }

    let outcome = refresh_metrics(&ctx, &MetricsJob::for_account(&account.id, BRAND))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        MetricsOutcome {
            updated: 4,
            failed: 1
        }
    );
    assert_eq!(instagram.config().metrics_call_count(), 5);

    for (n, item) in items.iter().enumerate() {
        let stored = h.db.get_post_metrics(&item.id).await.unwrap();
        if n == 2 {
            assert!(stored.is_none());
        } else {
            let stored = stored.unwrap();
            assert_eq!(stored.likes, 10);
            assert_eq!(stored.reach, 100);
            assert!((stored.engagement_rate - 0.13).abs() < f64::EPSILON);
        }
    }

    let envelopes = events.drain();
    assert_eq!(of_type(&envelopes, EventType::MetricsUpdated).len(), 4);

    let refreshed = h.db.get_account(&account.id).await.unwrap().unwrap();
    assert_eq!(refreshed.username.as_deref(), Some("mock_user"));
    assert_eq!(refreshed.follower_count, Some(1000));
}

#[tokio::test]
async fn test_batch_size_bounds_account_refresh() {
    let h = Harness::new().await;
    let facebook = Arc::new(MockAdapter::success(Platform::Facebook));
    let ctx = h
        .build_context(vec![facebook.clone()], generous_limits())
        .with_metrics_batch_size(2);

    let account = h.account(Platform::Facebook, "fb-1").await;
    let post = h.post().await;
    for n in 1..=4 {
        h.published_item(&post, &account, &format!("fb-post-{}", n)).await;
    }
    // Unpublished items are never refreshed
    h.item(&post, &account, "still a draft").await;

    let outcome = refresh_metrics(&ctx, &MetricsJob::for_account(&account.id, BRAND))
        .await
        .unwrap();
    assert_eq!(outcome.updated, 2);
    assert_eq!(facebook.config().metrics_call_count(), 2);
}

#[tokio::test]
async fn test_item_refresh_upserts_metrics() {
    let h = Harness::new().await;
    let ctx = h.context(vec![Arc::new(MockAdapter::success(Platform::X))]);

    let account = h.account(Platform::X, "x-1").await;
    let post = h.post().await;
    let item = h.published_item(&post, &account, "1790").await;

    let job = MetricsJob::for_item(&item.id, BRAND);
    refresh_metrics(&ctx, &job).await.unwrap();
    let first = h.db.get_post_metrics(&item.id).await.unwrap().unwrap();
    refresh_metrics(&ctx, &job).await.unwrap();
    let second = h.db.get_post_metrics(&item.id).await.unwrap().unwrap();

    assert_eq!(first.likes, second.likes);
    assert!(second.fetched_at >= first.fetched_at);
}

#[tokio::test]
async fn test_item_refresh_propagates_platform_errors() {
    let h = Harness::new().await;
    let ctx = h.context(vec![Arc::new(MockAdapter::new(MockConfig {
        failing_metrics: HashSet::from(["ig-broken".to_string()]),
        ..MockConfig::for_platform(Platform::Instagram)
    }))]);

    let account = h.account(Platform::Instagram, "ig-1").await;
    let post = h.post().await;
    let item = h.published_item(&post, &account, "ig-broken").await;

    let error = refresh_metrics(&ctx, &MetricsJob::for_item(&item.id, BRAND))
        .await
        .unwrap_err();
    assert!(!error.is_permanent());
}

#[tokio::test]
async fn test_metrics_job_without_target_is_invalid() {
    let h = Harness::new().await;
    let ctx = h.context(vec![]);
    let job = MetricsJob {
        post_item_id: None,
        social_account_id: None,
        brand_id: BRAND.to_string(),
    };

    match refresh_metrics(&ctx, &job).await {
        Err(SyndicastError::InvalidPayload(_)) => {}
        other => panic!("Expected InvalidPayload, got {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnected_account_is_skipped() {
    let h = Harness::new().await;
    let instagram = Arc::new(MockAdapter::success(Platform::Instagram));
    let ctx = h.context(vec![instagram.clone()]);

    let account = h.account(Platform::Instagram, "ig-1").await;
    let post = h.post().await;
    h.published_item(&post, &account, "ig-post-1").await;
    h.db.deactivate_account(&account.id).await.unwrap();

    let outcome = refresh_metrics(&ctx, &MetricsJob::for_account(&account.id, BRAND))
        .await
        .unwrap();
    assert_eq!(outcome, MetricsOutcome::default());
    assert_eq!(instagram.config().metrics_call_count(), 0);
}
