//! Instagram Graph API adapter
//!
//! Publishing is two-phase: create a media container (a carousel of child
//! containers for several images), then publish it. Instagram has no API
//! for deleting media.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;

use super::http::ApiClient;
use super::{
    not_implemented, parse_timestamp, webhook, AccountInfo, InboxMessage, MetricsSnapshot,
    PlatformAdapter, PublishRequest, PublishResult, ReplyRequest, ReplyResult,
};
use crate::config::PlatformConfig;
use crate::error::{PlatformError, Result};
use crate::types::{ConversationKind, Platform};

pub const DEFAULT_API_BASE: &str = "https://graph.instagram.com/v21.0";

const MAX_CAROUSEL_ITEMS: usize = 10;
const VIDEO_POLL_ATTEMPTS: u32 = 20;
const VIDEO_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

pub struct InstagramAdapter {
    api: ApiClient,
    app_secret: Option<String>,
    video_poll_interval: Duration,
}

fn is_video(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    path.ends_with(".mp4") || path.ends_with(".mov")
}

impl InstagramAdapter {
    pub fn new(config: Option<&PlatformConfig>) -> Result<Self> {
        Ok(Self {
            api: ApiClient::from_config(Platform::Instagram, DEFAULT_API_BASE, config)?,
            app_secret: config.and_then(|c| c.app_secret.clone()),
            video_poll_interval: VIDEO_POLL_INTERVAL,
        })
    }

    async fn create_container(&self, token: &str, params: &[(&str, String)]) -> Result<String> {
        let request = self.api.request(Method::POST, "me/media", token).form(params);
        let container: IdResponse = self.api.send_json(request, "media container").await?;
        Ok(container.id)
    }

    /// Video containers are processed asynchronously and must finish first
    async fn wait_until_ready(&self, token: &str, container_id: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct StatusResponse {
            status_code: Option<String>,
        }

        for _ in 0..VIDEO_POLL_ATTEMPTS {
            let request = self
                .api
                .request(Method::GET, container_id, token)
                .query(&[("fields", "status_code")]);
            let status: StatusResponse = self.api.send_json(request, container_id).await?;
            match status.status_code.as_deref() {
                Some("FINISHED") | None => return Ok(()),
                Some("ERROR") | Some("EXPIRED") => {
                    return Err(PlatformError::Validation {
                        platform: Platform::Instagram,
                        message: format!("media container {} could not be processed", container_id),
                    }
                    .into())
                }
                _ => tokio::time::sleep(self.video_poll_interval).await,
            }
        }

        Err(PlatformError::Timeout {
            platform: Platform::Instagram,
            message: format!("media container {} still processing", container_id),
        }
        .into())
    }

    async fn build_container(&self, token: &str, request: &PublishRequest) -> Result<String> {
        let caption = request.caption();
        match request.media_urls.as_slice() {
            [] => Err(PlatformError::Validation {
                platform: Platform::Instagram,
                message: "posts require at least one image or video".to_string(),
            }
            .into()),
            [url] if is_video(url) => {
                let id = self
                    .create_container(
                        token,
                        &[
                            ("media_type", "REELS".to_string()),
                            ("video_url", url.clone()),
                            ("caption", caption),
                        ],
                    )
                    .await?;
                self.wait_until_ready(token, &id).await?;
                Ok(id)
            }
            [url] => {
                self.create_container(
                    token,
                    &[("image_url", url.clone()), ("caption", caption)],
                )
                .await
            }
            urls if urls.len() > MAX_CAROUSEL_ITEMS => Err(PlatformError::Validation {
                platform: Platform::Instagram,
                message: format!(
                    "carousels hold at most {} items, got {}",
                    MAX_CAROUSEL_ITEMS,
                    urls.len()
                ),
            }
            .into()),
            urls => {
                let mut children = Vec::with_capacity(urls.len());
                for url in urls {
                    let (kind, field) = if is_video(url) {
                        ("VIDEO", "video_url")
                    } else {
                        ("IMAGE", "image_url")
                    };
                    let child = self
                        .create_container(
                            token,
                            &[
                                ("media_type", kind.to_string()),
                                (field, url.clone()),
                                ("is_carousel_item", "true".to_string()),
                            ],
                        )
                        .await?;
                    if kind == "VIDEO" {
                        self.wait_until_ready(token, &child).await?;
                    }
                    children.push(child);
                }
                self.create_container(
                    token,
                    &[
                        ("media_type", "CAROUSEL".to_string()),
                        ("children", children.join(",")),
                        ("caption", caption),
                    ],
                )
                .await
            }
        }
    }

    async fn permalink(&self, token: &str, media_id: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct PermalinkResponse {
            permalink: Option<String>,
        }

        let request = self
            .api
            .request(Method::GET, media_id, token)
            .query(&[("fields", "permalink")]);
        match self.api.send_json::<PermalinkResponse>(request, media_id).await {
            Ok(response) => response.permalink,
            Err(e) => {
                tracing::debug!(media_id = %media_id, error = %e, "Could not fetch permalink");
                None
            }
        }
    }
}

#[derive(Deserialize)]
struct InsightsResponse {
    data: Vec<InsightMetric>,
}

#[derive(Deserialize)]
struct InsightMetric {
    name: String,
    #[serde(default)]
    values: Vec<InsightValue>,
    total_value: Option<InsightValue>,
}

#[derive(Deserialize)]
struct InsightValue {
    value: i64,
}

impl InsightsResponse {
    fn value(&self, name: &str) -> Option<i64> {
        self.data.iter().find(|m| m.name == name).and_then(|m| {
            m.total_value
                .as_ref()
                .map(|v| v.value)
                .or_else(|| m.values.first().map(|v| v.value))
        })
    }
}

#[derive(Deserialize)]
pub(crate) struct GraphConversations {
    #[serde(default)]
    pub data: Vec<GraphConversation>,
}

#[derive(Deserialize)]
pub(crate) struct GraphConversation {
    pub id: String,
    pub messages: Option<GraphMessages>,
}

#[derive(Deserialize)]
pub(crate) struct GraphMessages {
    #[serde(default)]
    pub data: Vec<GraphMessage>,
}

#[derive(Deserialize)]
pub(crate) struct GraphMessage {
    pub id: String,
    pub created_time: String,
    pub from: Option<GraphUser>,
    #[serde(default)]
    pub message: String,
}

#[derive(Deserialize)]
pub(crate) struct GraphUser {
    pub id: String,
    pub username: Option<String>,
    pub name: Option<String>,
}

impl GraphConversations {
    /// Flatten threads into inbox messages newer than `since`, oldest first
    pub(crate) fn into_messages(self, since: Option<i64>) -> Vec<InboxMessage> {
        let mut messages: Vec<InboxMessage> = self
            .data
            .into_iter()
            .flat_map(|conversation| {
                let thread_id = conversation.id;
                conversation
                    .messages
                    .map(|m| m.data)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(move |message| {
                        let sent_at = parse_timestamp(&message.created_time)?;
                        let (sender_id, sender_name) = match message.from {
                            Some(user) => (Some(user.id), user.username.or(user.name)),
                            None => (None, None),
                        };
                        Some(InboxMessage {
                            conversation_external_id: thread_id.clone(),
                            message_external_id: message.id,
                            kind: ConversationKind::DirectMessage,
                            sender_id,
                            sender_name,
                            content: message.message,
                            sent_at,
                        })
                    })
            })
            .filter(|message| since.map_or(true, |since| message.sent_at > since))
            .collect();
        messages.sort_by_key(|m| m.sent_at);
        messages
    }
}

/// Meta's messaging send endpoint shared by Instagram and Facebook
pub(crate) async fn send_graph_message(
    api: &ApiClient,
    token: &str,
    request: &ReplyRequest,
) -> Result<ReplyResult> {
    #[derive(Deserialize)]
    struct SendResponse {
        message_id: String,
    }

    let recipient = request.recipient_id.as_deref().ok_or_else(|| PlatformError::Validation {
        platform: api.platform(),
        message: format!("conversation {} has no recipient id", request.conversation_id),
    })?;
    let body = serde_json::json!({
        "recipient": { "id": recipient },
        "message": { "text": request.content },
        "messaging_type": "RESPONSE",
    });
    let http = api.request(Method::POST, "me/messages", token).json(&body);
    let sent: SendResponse = api.send_json(http, "send message").await?;
    Ok(ReplyResult {
        external_message_id: sent.message_id,
        created_at: chrono::Utc::now().timestamp(),
    })
}

#[async_trait]
impl PlatformAdapter for InstagramAdapter {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    async fn get_account(&self, token: &str) -> Result<AccountInfo> {
        #[derive(Deserialize)]
        struct Profile {
            id: String,
            user_id: Option<String>,
            username: Option<String>,
            name: Option<String>,
            profile_picture_url: Option<String>,
            followers_count: Option<i64>,
            media_count: Option<i64>,
        }

        let request = self.api.request(Method::GET, "me", token).query(&[(
            "fields",
            "id,user_id,username,name,profile_picture_url,followers_count,media_count",
        )]);
        let profile: Profile = self.api.send_json(request, "me").await?;

        let mut metadata = serde_json::Map::new();
        if let Some(count) = profile.media_count {
            metadata.insert("mediaCount".to_string(), count.into());
        }
        Ok(AccountInfo {
            id: profile.user_id.unwrap_or(profile.id),
            username: profile.username,
            display_name: profile.name,
            avatar_url: profile.profile_picture_url,
            follower_count: profile.followers_count,
            metadata,
        })
    }

    async fn publish(&self, token: &str, request: &PublishRequest) -> Result<PublishResult> {
        let container_id = self.build_container(token, request).await?;

        let publish = self
            .api
            .request(Method::POST, "me/media_publish", token)
            .form(&[("creation_id", container_id.as_str())]);
        let media: IdResponse = self.api.send_json(publish, "media publish").await?;

        let url = self.permalink(token, &media.id).await;
        let mut metadata = serde_json::Map::new();
        metadata.insert("containerId".to_string(), container_id.into());
        if let Some(url) = &url {
            metadata.insert("permalink".to_string(), url.clone().into());
        }

        Ok(PublishResult {
            external_post_id: media.id,
            url,
            published_at: chrono::Utc::now().timestamp(),
            metadata,
        })
    }

    async fn delete(&self, _token: &str, _external_post_id: &str) -> Result<()> {
        Err(not_implemented(Platform::Instagram, "delete"))
    }

    async fn fetch_metrics(&self, token: &str, external_post_id: &str) -> Result<MetricsSnapshot> {
        let request = self
            .api
            .request(Method::GET, &format!("{}/insights", external_post_id), token)
            .query(&[("metric", "likes,comments,shares,saved,reach,views")]);
        let insights: InsightsResponse = self.api.send_json(request, external_post_id).await?;

        let likes = insights.value("likes").unwrap_or(0);
        let comments = insights.value("comments").unwrap_or(0);
        let shares = insights.value("shares").unwrap_or(0);
        let saves = insights.value("saved");
        let reach = insights.value("reach").unwrap_or(0);
        let views = insights.value("views").unwrap_or(0);

        Ok(MetricsSnapshot {
            likes,
            comments,
            shares,
            views,
            reach,
            engagement: MetricsSnapshot::engagement_rate(
                likes + comments + shares + saves.unwrap_or(0),
                reach,
            ),
            saves,
        })
    }

    fn supports_reply(&self) -> bool {
        true
    }

    async fn reply(&self, token: &str, request: &ReplyRequest) -> Result<ReplyResult> {
        send_graph_message(&self.api, token, request).await
    }

    fn supports_inbox(&self) -> bool {
        true
    }

    async fn fetch_inbox_messages(&self, token: &str, since: Option<i64>) -> Result<Vec<InboxMessage>> {
        let request = self.api.request(Method::GET, "me/conversations", token).query(&[
            ("platform", "instagram"),
            (
                "fields",
                "id,updated_time,messages.limit(25){id,created_time,from,message}",
            ),
        ]);
        let conversations: GraphConversations = self.api.send_json(request, "conversations").await?;
        Ok(conversations.into_messages(since))
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> Result<bool> {
        match &self.app_secret {
            Some(secret) => Ok(webhook::verify_hex_signature(secret, payload, signature)),
            None => {
                tracing::warn!("Instagram webhook received but no app secret is configured");
                Ok(false)
            }
        }
    }
}
