//! Mock platform adapter for testing
//!
//! A configurable adapter that can simulate successes, failures, delays and
//! inbox contents without network access. Call records live behind `Arc`s
//! shared with the [`MockConfig`], so a test can keep a clone of the config
//! and inspect what the adapter saw after handing it to a registry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use super::{
    not_implemented, AccountInfo, InboxMessage, MetricsSnapshot, PlatformAdapter, PublishRequest,
    PublishResult, ReplyRequest, ReplyResult,
};
use crate::error::{PlatformError, Result};
use crate::types::Platform;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Configuration for mock adapter behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub platform: Platform,

    /// Error returned by every publish call
    pub publish_error: Option<PlatformError>,

    /// Error returned by every metrics call
    pub metrics_error: Option<PlatformError>,

    /// External post ids whose metrics fetch fails with a server error
    pub failing_metrics: HashSet<String>,

    /// Metrics returned for every other post
    pub metrics: MetricsSnapshot,

    /// Error returned by inbox fetches
    pub inbox_error: Option<PlatformError>,

    /// Messages served by inbox fetches, filtered by `since`
    pub inbox: Arc<Mutex<Vec<InboxMessage>>>,

    pub supports_inbox: bool,

    pub supports_reply: bool,

    /// Delay before completing operations (simulates network latency)
    pub delay: Duration,

    pub publish_call_count: Arc<Mutex<usize>>,

    pub metrics_call_count: Arc<Mutex<usize>>,

    pub inbox_call_count: Arc<Mutex<usize>>,

    /// Requests that were published (for verification)
    pub published: Arc<Mutex<Vec<PublishRequest>>>,

    pub replies: Arc<Mutex<Vec<ReplyRequest>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            platform: Platform::Instagram,
            publish_error: None,
            metrics_error: None,
            failing_metrics: HashSet::new(),
            metrics: MetricsSnapshot {
                likes: 10,
                comments: 2,
                shares: 1,
                views: 200,
                reach: 100,
                engagement: 0.13,
                saves: None,
            },
            inbox_error: None,
            inbox: Arc::new(Mutex::new(Vec::new())),
            supports_inbox: true,
            supports_reply: true,
            delay: Duration::from_millis(0),
            publish_call_count: Arc::new(Mutex::new(0)),
            metrics_call_count: Arc::new(Mutex::new(0)),
            inbox_call_count: Arc::new(Mutex::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MockConfig {
    pub fn for_platform(platform: Platform) -> Self {
        Self {
            platform,
            ..Default::default()
        }
    }

    pub fn publish_call_count(&self) -> usize {
        *lock(&self.publish_call_count)
    }

    pub fn metrics_call_count(&self) -> usize {
        *lock(&self.metrics_call_count)
    }

    pub fn inbox_call_count(&self) -> usize {
        *lock(&self.inbox_call_count)
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        lock(&self.published).clone()
    }

    pub fn replies(&self) -> Vec<ReplyRequest> {
        lock(&self.replies).clone()
    }

    /// Add a message to the simulated inbox
    pub fn push_inbox_message(&self, message: InboxMessage) {
        lock(&self.inbox).push(message);
    }
}

/// Mock adapter for testing
pub struct MockAdapter {
    config: MockConfig,
}

impl MockAdapter {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// A mock adapter that always succeeds
    pub fn success(platform: Platform) -> Self {
        Self::new(MockConfig::for_platform(platform))
    }

    /// A mock adapter whose publish calls fail with `error`
    pub fn publish_failure(platform: Platform, error: PlatformError) -> Self {
        Self::new(MockConfig {
            publish_error: Some(error),
            ..MockConfig::for_platform(platform)
        })
    }

    /// A mock adapter whose publish calls are rate limited
    pub fn rate_limited(platform: Platform) -> Self {
        Self::publish_failure(
            platform,
            PlatformError::RateLimit {
                platform,
                message: "Mock rate limit".to_string(),
                retry_after: Some(60),
            },
        )
    }

    /// A mock adapter with a delay
    pub fn with_delay(platform: Platform, delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..MockConfig::for_platform(platform)
        })
    }

    pub fn config(&self) -> &MockConfig {
        &self.config
    }

    async fn simulate_latency(&self) {
        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.config.platform
    }

    async fn get_account(&self, _token: &str) -> Result<AccountInfo> {
        self.simulate_latency().await;
        Ok(AccountInfo {
            id: format!("mock-{}-account", self.config.platform),
            username: Some("mock_user".to_string()),
            display_name: Some("Mock User".to_string()),
            avatar_url: None,
            follower_count: Some(1000),
            metadata: serde_json::Map::new(),
        })
    }

    async fn publish(&self, _token: &str, request: &PublishRequest) -> Result<PublishResult> {
        let call = {
            let mut count = lock(&self.config.publish_call_count);
            *count += 1;
            *count
        };

        self.simulate_latency().await;

        if let Some(error) = &self.config.publish_error {
            return Err(error.clone().into());
        }

        lock(&self.config.published).push(request.clone());
        let external_post_id = format!("mock-{}-{}-{}", self.config.platform, call, uuid::Uuid::new_v4());
        Ok(PublishResult {
            url: Some(format!("https://mock.example/{}", external_post_id)),
            external_post_id,
            published_at: chrono::Utc::now().timestamp(),
            metadata: serde_json::Map::new(),
        })
    }

    async fn delete(&self, _token: &str, _external_post_id: &str) -> Result<()> {
        self.simulate_latency().await;
        Ok(())
    }

    async fn fetch_metrics(&self, _token: &str, external_post_id: &str) -> Result<MetricsSnapshot> {
        *lock(&self.config.metrics_call_count) += 1;
        self.simulate_latency().await;

        if let Some(error) = &self.config.metrics_error {
            return Err(error.clone().into());
        }
        if self.config.failing_metrics.contains(external_post_id) {
            return Err(PlatformError::Api {
                platform: self.config.platform,
                status: 500,
                message: format!("Mock metrics failure for {}", external_post_id),
            }
            .into());
        }
        Ok(self.config.metrics.clone())
    }

    fn supports_reply(&self) -> bool {
        self.config.supports_reply
    }

    async fn reply(&self, _token: &str, request: &ReplyRequest) -> Result<ReplyResult> {
        if !self.config.supports_reply {
            return Err(not_implemented(self.config.platform, "reply"));
        }
        self.simulate_latency().await;
        lock(&self.config.replies).push(request.clone());
        Ok(ReplyResult {
            external_message_id: format!("mock-reply-{}", uuid::Uuid::new_v4()),
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    fn supports_inbox(&self) -> bool {
        self.config.supports_inbox
    }

    async fn fetch_inbox_messages(&self, _token: &str, since: Option<i64>) -> Result<Vec<InboxMessage>> {
        if !self.config.supports_inbox {
            return Err(not_implemented(self.config.platform, "inbox"));
        }
        *lock(&self.config.inbox_call_count) += 1;
        self.simulate_latency().await;

        if let Some(error) = &self.config.inbox_error {
            return Err(error.clone().into());
        }

        let mut messages: Vec<InboxMessage> = lock(&self.config.inbox)
            .iter()
            .filter(|m| since.map_or(true, |since| m.sent_at > since))
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.sent_at);
        Ok(messages)
    }

    fn verify_webhook_signature(&self, _payload: &[u8], signature: &str) -> Result<bool> {
        Ok(signature == "mock-valid")
    }
}
