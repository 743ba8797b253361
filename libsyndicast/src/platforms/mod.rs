//! Platform adapter abstraction and implementations
//!
//! Every platform is reached through [`PlatformAdapter`]. Adapters take a
//! decrypted access token per call and hold no per-account state, so one
//! adapter instance serves every account on its platform.
//!
//! ```no_run
//! use libsyndicast::platforms::{registry::AdapterRegistry, PublishRequest};
//! use libsyndicast::config::PlatformsConfig;
//! use libsyndicast::types::Platform;
//!
//! # async fn example() -> libsyndicast::error::Result<()> {
//! let registry = AdapterRegistry::from_config(&PlatformsConfig::default())?;
//! let adapter = registry.get(Platform::X);
//! let request = PublishRequest::text("Hello from the pipeline");
//! let result = adapter.publish("access-token", &request).await?;
//! println!("Published {}", result.external_post_id);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};
use crate::types::{ConversationKind, Platform, PostItem};

pub mod facebook;
pub mod http;
pub mod instagram;
pub mod registry;
pub mod stub;
pub mod webhook;
pub mod x;

// Available outside tests so integration tests can drive handlers end to end
pub mod mock;

pub use registry::AdapterRegistry;

/// Profile of the connected account as the platform reports it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub follower_count: Option<i64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub content: String,
    pub media_urls: Vec<String>,
    pub hashtags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl PublishRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn from_item(item: &PostItem) -> Self {
        Self {
            content: item.content.clone(),
            media_urls: item.media_urls.clone(),
            hashtags: item.hashtags.clone(),
            metadata: item.metadata.clone(),
        }
    }

    /// Content followed by the hashtags not already present in it
    pub fn caption(&self) -> String {
        let mut caption = self.content.trim_end().to_string();
        let tags: Vec<String> = self
            .hashtags
            .iter()
            .map(|tag| format!("#{}", tag.trim_start_matches('#')))
            .filter(|tag| !caption.contains(tag.as_str()))
            .collect();
        if !tags.is_empty() {
            if !caption.is_empty() {
                caption.push_str("\n\n");
            }
            caption.push_str(&tags.join(" "));
        }
        caption
    }
}

/// Outcome of a successful publish. `external_post_id` is always populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    pub external_post_id: String,
    pub url: Option<String>,
    /// Unix seconds
    pub published_at: i64,
    /// Merged into the post item's metadata
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub views: i64,
    pub reach: i64,
    /// Interactions divided by reach (or impressions when reach is unknown)
    pub engagement: f64,
    pub saves: Option<i64>,
}

impl MetricsSnapshot {
    pub fn engagement_rate(interactions: i64, audience: i64) -> f64 {
        if audience <= 0 {
            return 0.0;
        }
        interactions as f64 / audience as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRequest {
    /// Platform conversation id
    pub conversation_id: String,
    /// Platform user id of the other participant, when the API addresses users
    pub recipient_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyResult {
    pub external_message_id: String,
    /// Unix seconds
    pub created_at: i64,
}

/// A message pulled from the platform inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub conversation_external_id: String,
    pub message_external_id: String,
    pub kind: ConversationKind,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub content: String,
    /// Unix seconds
    pub sent_at: i64,
}

pub(crate) fn not_implemented(platform: Platform, capability: &'static str) -> crate::error::SyndicastError {
    PlatformError::NotImplemented {
        platform,
        capability,
    }
    .into()
}

/// Uniform capability contract every platform implements.
///
/// Every call is fallible. Network and API errors surface as
/// [`PlatformError`] with the platform named, so handlers can decide whether
/// a retry is worthwhile.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Fetch the profile of the account owning `token`
    async fn get_account(&self, token: &str) -> Result<AccountInfo>;

    async fn publish(&self, token: &str, request: &PublishRequest) -> Result<PublishResult>;

    async fn delete(&self, token: &str, external_post_id: &str) -> Result<()>;

    async fn fetch_metrics(&self, token: &str, external_post_id: &str) -> Result<MetricsSnapshot>;

    fn supports_reply(&self) -> bool {
        false
    }

    async fn reply(&self, token: &str, request: &ReplyRequest) -> Result<ReplyResult> {
        let _ = (token, request);
        Err(not_implemented(self.platform(), "reply"))
    }

    fn supports_inbox(&self) -> bool {
        false
    }

    /// Messages newer than `since` (Unix seconds), oldest first
    async fn fetch_inbox_messages(&self, token: &str, since: Option<i64>) -> Result<Vec<InboxMessage>> {
        let _ = (token, since);
        Err(not_implemented(self.platform(), "inbox"))
    }

    /// Check a webhook delivery against the platform's signature header
    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> Result<bool> {
        let _ = (payload, signature);
        Err(not_implemented(self.platform(), "webhook verification"))
    }
}

/// Parse a platform timestamp into Unix seconds.
///
/// Accepts RFC 3339 and the `+0000` offset form the Graph API emits.
pub(crate) fn parse_timestamp(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .or_else(|_| chrono::DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|dt| dt.timestamp())
        .ok()
}
