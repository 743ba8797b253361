//! X (Twitter) API v2 adapter

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;

use super::http::ApiClient;
use super::{
    parse_timestamp, webhook, AccountInfo, InboxMessage, MetricsSnapshot, PlatformAdapter,
    PublishRequest, PublishResult, ReplyRequest, ReplyResult,
};
use crate::config::PlatformConfig;
use crate::error::{PlatformError, Result};
use crate::types::{ConversationKind, Platform};

pub const DEFAULT_API_BASE: &str = "https://api.twitter.com";

pub const MAX_TWEET_CHARS: usize = 280;

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

pub struct XAdapter {
    api: ApiClient,
    consumer_secret: Option<String>,
}

impl XAdapter {
    pub fn new(config: Option<&PlatformConfig>) -> Result<Self> {
        Ok(Self {
            api: ApiClient::from_config(Platform::X, DEFAULT_API_BASE, config)?,
            consumer_secret: config.and_then(|c| c.app_secret.clone()),
        })
    }
}

/// Tweet text: caption plus media links, which v2 cannot attach by URL
fn tweet_text(request: &PublishRequest) -> Result<String> {
    let mut text = request.caption();
    for url in &request.media_urls {
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(url);
    }

    let length = text.chars().count();
    if length > MAX_TWEET_CHARS {
        return Err(PlatformError::Validation {
            platform: Platform::X,
            message: format!("tweet is {} characters, limit is {}", length, MAX_TWEET_CHARS),
        }
        .into());
    }
    if text.trim().is_empty() {
        return Err(PlatformError::Validation {
            platform: Platform::X,
            message: "tweet text is empty".to_string(),
        }
        .into());
    }
    Ok(text)
}

#[derive(Deserialize)]
struct DmEvent {
    id: String,
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    text: String,
    sender_id: Option<String>,
    dm_conversation_id: Option<String>,
    created_at: Option<String>,
}

#[async_trait]
impl PlatformAdapter for XAdapter {
    fn platform(&self) -> Platform {
        Platform::X
    }

    async fn get_account(&self, token: &str) -> Result<AccountInfo> {
        #[derive(Deserialize)]
        struct User {
            id: String,
            username: String,
            name: Option<String>,
            profile_image_url: Option<String>,
            public_metrics: Option<UserMetrics>,
            verified: Option<bool>,
        }

        #[derive(Deserialize)]
        struct UserMetrics {
            followers_count: i64,
        }

        let request = self
            .api
            .request(Method::GET, "2/users/me", token)
            .query(&[("user.fields", "profile_image_url,public_metrics,verified")]);
        let user: Envelope<User> = self.api.send_json(request, "users/me").await?;
        let user = user.data;

        let mut metadata = serde_json::Map::new();
        if let Some(verified) = user.verified {
            metadata.insert("verified".to_string(), verified.into());
        }
        Ok(AccountInfo {
            id: user.id,
            username: Some(user.username),
            display_name: user.name,
            avatar_url: user.profile_image_url,
            follower_count: user.public_metrics.map(|m| m.followers_count),
            metadata,
        })
    }

    async fn publish(&self, token: &str, request: &PublishRequest) -> Result<PublishResult> {
        #[derive(Deserialize)]
        struct Created {
            id: String,
        }

        let text = tweet_text(request)?;
        let mut body = serde_json::json!({ "text": text });
        if let Some(reply_to) = request.metadata.get("replyTo").and_then(|v| v.as_str()) {
            body["reply"] = serde_json::json!({ "in_reply_to_tweet_id": reply_to });
        }

        let http = self.api.request(Method::POST, "2/tweets", token).json(&body);
        let created: Envelope<Created> = self.api.send_json(http, "tweet").await?;
        let id = created.data.id;

        Ok(PublishResult {
            url: Some(format!("https://x.com/i/web/status/{}", id)),
            external_post_id: id,
            published_at: chrono::Utc::now().timestamp(),
            metadata: serde_json::Map::new(),
        })
    }

    async fn delete(&self, token: &str, external_post_id: &str) -> Result<()> {
        let request = self
            .api
            .request(Method::DELETE, &format!("2/tweets/{}", external_post_id), token);
        self.api.send(request, external_post_id).await?;
        Ok(())
    }

    async fn fetch_metrics(&self, token: &str, external_post_id: &str) -> Result<MetricsSnapshot> {
        #[derive(Deserialize)]
        struct Tweet {
            public_metrics: PublicMetrics,
        }

        #[derive(Deserialize)]
        struct PublicMetrics {
            #[serde(default)]
            like_count: i64,
            #[serde(default)]
            reply_count: i64,
            #[serde(default)]
            retweet_count: i64,
            #[serde(default)]
            quote_count: i64,
            #[serde(default)]
            impression_count: i64,
            bookmark_count: Option<i64>,
        }

        let request = self
            .api
            .request(Method::GET, &format!("2/tweets/{}", external_post_id), token)
            .query(&[("tweet.fields", "public_metrics")]);
        let tweet: Envelope<Tweet> = self.api.send_json(request, external_post_id).await?;
        let m = tweet.data.public_metrics;

        let shares = m.retweet_count + m.quote_count;
        Ok(MetricsSnapshot {
            likes: m.like_count,
            comments: m.reply_count,
            shares,
            views: m.impression_count,
            // X does not report unique reach
            reach: 0,
            engagement: MetricsSnapshot::engagement_rate(
                m.like_count + m.reply_count + shares,
                m.impression_count,
            ),
            saves: m.bookmark_count,
        })
    }

    fn supports_reply(&self) -> bool {
        true
    }

    async fn reply(&self, token: &str, request: &ReplyRequest) -> Result<ReplyResult> {
        #[derive(Deserialize)]
        struct Sent {
            dm_event_id: String,
        }

        let path = format!("2/dm_conversations/{}/messages", request.conversation_id);
        let body = serde_json::json!({ "text": request.content });
        let http = self.api.request(Method::POST, &path, token).json(&body);
        let sent: Envelope<Sent> = self.api.send_json(http, "send dm").await?;

        Ok(ReplyResult {
            external_message_id: sent.data.dm_event_id,
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    fn supports_inbox(&self) -> bool {
        true
    }

    async fn fetch_inbox_messages(&self, token: &str, since: Option<i64>) -> Result<Vec<InboxMessage>> {
        #[derive(Deserialize)]
        struct Events {
            #[serde(default)]
            data: Vec<DmEvent>,
        }

        let request = self.api.request(Method::GET, "2/dm_events", token).query(&[
            ("dm_event.fields", "id,text,event_type,created_at,sender_id,dm_conversation_id"),
            ("event_types", "MessageCreate"),
            ("max_results", "50"),
        ]);
        let events: Events = self.api.send_json(request, "dm_events").await?;

        let mut messages: Vec<InboxMessage> = events
            .data
            .into_iter()
            .filter(|e| e.event_type.is_empty() || e.event_type == "MessageCreate")
            .filter_map(|event| {
                let sent_at = parse_timestamp(event.created_at.as_deref()?)?;
                Some(InboxMessage {
                    conversation_external_id: event.dm_conversation_id?,
                    message_external_id: event.id,
                    kind: ConversationKind::DirectMessage,
                    sender_id: event.sender_id,
                    sender_name: None,
                    content: event.text,
                    sent_at,
                })
            })
            .filter(|m| since.map_or(true, |since| m.sent_at > since))
            .collect();
        messages.sort_by_key(|m| m.sent_at);
        Ok(messages)
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> Result<bool> {
        match &self.consumer_secret {
            Some(secret) => Ok(webhook::verify_base64_signature(secret, payload, signature)),
            None => {
                tracing::warn!("X webhook received but no consumer secret is configured");
                Ok(false)
            }
        }
    }
}
