//! Facebook Page adapter (Graph API)
//!
//! The access token stored for a Facebook account is a Page token, so `me`
//! resolves to the Page itself.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;

use super::http::ApiClient;
use super::instagram::{send_graph_message, GraphConversations};
use super::{
    webhook, AccountInfo, InboxMessage, MetricsSnapshot, PlatformAdapter, PublishRequest,
    PublishResult, ReplyRequest, ReplyResult,
};
use crate::config::PlatformConfig;
use crate::error::Result;
use crate::types::Platform;

pub const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v21.0";

#[derive(Deserialize)]
struct IdResponse {
    id: String,
    post_id: Option<String>,
}

pub struct FacebookAdapter {
    api: ApiClient,
    app_secret: Option<String>,
}

impl FacebookAdapter {
    pub fn new(config: Option<&PlatformConfig>) -> Result<Self> {
        Ok(Self {
            api: ApiClient::from_config(Platform::Facebook, DEFAULT_API_BASE, config)?,
            app_secret: config.and_then(|c| c.app_secret.clone()),
        })
    }

    /// Unpublished photo to attach to a multi-photo feed post
    async fn upload_photo(&self, token: &str, url: &str) -> Result<String> {
        let request = self
            .api
            .request(Method::POST, "me/photos", token)
            .form(&[("url", url), ("published", "false")]);
        let photo: IdResponse = self.api.send_json(request, "photo upload").await?;
        Ok(photo.id)
    }

    async fn post(&self, token: &str, request: &PublishRequest) -> Result<IdResponse> {
        let message = request.caption();
        match request.media_urls.as_slice() {
            [] => {
                let mut body = serde_json::json!({ "message": message });
                if let Some(link) = request.metadata.get("link").and_then(|v| v.as_str()) {
                    body["link"] = link.into();
                }
                let http = self.api.request(Method::POST, "me/feed", token).json(&body);
                self.api.send_json(http, "feed post").await
            }
            [url] => {
                let http = self
                    .api
                    .request(Method::POST, "me/photos", token)
                    .form(&[("url", url.as_str()), ("caption", message.as_str())]);
                self.api.send_json(http, "photo post").await
            }
            urls => {
                let mut attached = Vec::with_capacity(urls.len());
                for url in urls {
                    let id = self.upload_photo(token, url).await?;
                    attached.push(serde_json::json!({ "media_fbid": id }));
                }
                let body = serde_json::json!({
                    "message": message,
                    "attached_media": attached,
                });
                let http = self.api.request(Method::POST, "me/feed", token).json(&body);
                self.api.send_json(http, "feed post").await
            }
        }
    }
}

#[derive(Deserialize)]
struct Summary {
    total_count: i64,
}

#[derive(Deserialize)]
struct Summarized {
    summary: Option<Summary>,
}

#[derive(Deserialize)]
struct Shares {
    count: i64,
}

#[derive(Deserialize)]
struct PostFields {
    reactions: Option<Summarized>,
    comments: Option<Summarized>,
    shares: Option<Shares>,
    insights: Option<Insights>,
}

#[derive(Deserialize)]
struct Insights {
    #[serde(default)]
    data: Vec<Insight>,
}

#[derive(Deserialize)]
struct Insight {
    name: String,
    #[serde(default)]
    values: Vec<InsightValue>,
}

#[derive(Deserialize)]
struct InsightValue {
    value: serde_json::Value,
}

impl Insights {
    fn value(&self, name: &str) -> Option<i64> {
        self.data
            .iter()
            .find(|i| i.name == name)
            .and_then(|i| i.values.first())
            .and_then(|v| v.value.as_i64())
    }
}

fn total(field: &Option<Summarized>) -> i64 {
    field
        .as_ref()
        .and_then(|f| f.summary.as_ref())
        .map_or(0, |s| s.total_count)
}

#[async_trait]
impl PlatformAdapter for FacebookAdapter {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    async fn get_account(&self, token: &str) -> Result<AccountInfo> {
        #[derive(Deserialize)]
        struct Page {
            id: String,
            name: Option<String>,
            username: Option<String>,
            followers_count: Option<i64>,
            fan_count: Option<i64>,
            link: Option<String>,
            picture: Option<Picture>,
        }

        #[derive(Deserialize)]
        struct Picture {
            data: PictureData,
        }

        #[derive(Deserialize)]
        struct PictureData {
            url: Option<String>,
        }

        let request = self.api.request(Method::GET, "me", token).query(&[(
            "fields",
            "id,name,username,followers_count,fan_count,link,picture{url}",
        )]);
        let page: Page = self.api.send_json(request, "me").await?;

        let mut metadata = serde_json::Map::new();
        if let Some(link) = page.link {
            metadata.insert("link".to_string(), link.into());
        }
        Ok(AccountInfo {
            id: page.id,
            username: page.username,
            display_name: page.name,
            avatar_url: page.picture.and_then(|p| p.data.url),
            follower_count: page.followers_count.or(page.fan_count),
            metadata,
        })
    }

    async fn publish(&self, token: &str, request: &PublishRequest) -> Result<PublishResult> {
        let created = self.post(token, request).await?;
        // Photo posts return the photo id plus the feed story id
        let external_post_id = created.post_id.unwrap_or(created.id);

        Ok(PublishResult {
            url: Some(format!("https://www.facebook.com/{}", external_post_id)),
            external_post_id,
            published_at: chrono::Utc::now().timestamp(),
            metadata: serde_json::Map::new(),
        })
    }

    async fn delete(&self, token: &str, external_post_id: &str) -> Result<()> {
        let request = self.api.request(Method::DELETE, external_post_id, token);
        self.api.send(request, external_post_id).await?;
        Ok(())
    }

    async fn fetch_metrics(&self, token: &str, external_post_id: &str) -> Result<MetricsSnapshot> {
        let request = self.api.request(Method::GET, external_post_id, token).query(&[(
            "fields",
            "reactions.summary(total_count).limit(0),comments.summary(total_count).limit(0),shares,\
             insights.metric(post_impressions,post_impressions_unique)",
        )]);
        let fields: PostFields = self.api.send_json(request, external_post_id).await?;

        let likes = total(&fields.reactions);
        let comments = total(&fields.comments);
        let shares = fields.shares.map_or(0, |s| s.count);
        let views = fields
            .insights
            .as_ref()
            .and_then(|i| i.value("post_impressions"))
            .unwrap_or(0);
        let reach = fields
            .insights
            .as_ref()
            .and_then(|i| i.value("post_impressions_unique"))
            .unwrap_or(0);
        let audience = if reach > 0 { reach } else { views };

        Ok(MetricsSnapshot {
            likes,
            comments,
            shares,
            views,
            reach,
            engagement: MetricsSnapshot::engagement_rate(likes + comments + shares, audience),
            saves: None,
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
        let request = self.api.request(Method::GET, "me/conversations", token).query(&[(
            "fields",
            "id,updated_time,messages.limit(25){id,created_time,from,message}",
        )]);
        let conversations: GraphConversations = self.api.send_json(request, "conversations").await?;
        Ok(conversations.into_messages(since))
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> Result<bool> {
        match &self.app_secret {
            Some(secret) => Ok(webhook::verify_hex_signature(secret, payload, signature)),
            None => {
                tracing::warn!("Facebook webhook received but no app secret is configured");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PlatformError, SyndicastError};
    use mockito::Matcher;

    fn adapter(server: &mockito::Server) -> FacebookAdapter {
        let config = PlatformConfig {
            api_base: Some(server.url()),
            timeout_secs: 5,
            app_secret: None,
        };
        FacebookAdapter::new(Some(&config)).unwrap()
    }

    #[tokio::test]
    async fn test_publish_text_post() {
        let mut server = mockito::Server::new_async().await;
        let feed = server
            .mock("POST", "/me/feed")
            .match_header("authorization", "Bearer page-token")
            .match_body(Matcher::PartialJson(serde_json::json!({"message": "Store opens at 9"})))
            .with_body(r#"{"id":"123_456"}"#)
            .create_async()
            .await;

        let result = adapter(&server)
            .publish("page-token", &PublishRequest::text("Store opens at 9"))
            .await
            .unwrap();

        feed.assert_async().await;
        assert_eq!(result.external_post_id, "123_456");
        assert_eq!(result.url.as_deref(), Some("https://www.facebook.com/123_456"));
    }

    #[tokio::test]
    async fn test_publish_single_photo_uses_story_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/me/photos")
            .match_body(Matcher::UrlEncoded("url".into(), "https://cdn.example.com/a.jpg".into()))
            .with_body(r#"{"id":"photo_1","post_id":"123_789"}"#)
            .create_async()
            .await;

        let request = PublishRequest {
            content: "Fresh stock".to_string(),
            media_urls: vec!["https://cdn.example.com/a.jpg".to_string()],
            ..Default::default()
        };
        let result = adapter(&server).publish("page-token", &request).await.unwrap();
        assert_eq!(result.external_post_id, "123_789");
    }

    #[tokio::test]
    async fn test_publish_multi_photo_attaches_media() {
        let mut server = mockito::Server::new_async().await;
        let uploads = server
            .mock("POST", "/me/photos")
            .match_body(Matcher::UrlEncoded("published".into(), "false".into()))
            .with_body(r#"{"id":"p_1"}"#)
            .expect(2)
            .create_async()
            .await;
        let feed = server
            .mock("POST", "/me/feed")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "attached_media": [{"media_fbid": "p_1"}, {"media_fbid": "p_1"}]
            })))
            .with_body(r#"{"id":"123_999"}"#)
            .create_async()
            .await;

        let request = PublishRequest {
            content: "Lookbook".to_string(),
            media_urls: vec![
                "https://cdn.example.com/a.jpg".to_string(),
                "https://cdn.example.com/b.jpg".to_string(),
            ],
            ..Default::default()
        };
        let result = adapter(&server).publish("page-token", &request).await.unwrap();

        uploads.assert_async().await;
        feed.assert_async().await;
        assert_eq!(result.external_post_id, "123_999");
    }

    #[tokio::test]
    async fn test_delete_missing_post_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/123_456")
            .with_status(404)
            .with_body(r#"{"error":{"message":"Unsupported delete request","code":100}}"#)
            .create_async()
            .await;

        match adapter(&server).delete("page-token", "123_456").await {
            Err(SyndicastError::Platform(PlatformError::NotFound { external_id, .. })) => {
                assert_eq!(external_id, "123_456")
            }
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_metrics() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/123_456")
            .match_query(Matcher::Any)
            .with_body(
                r#"{
                    "reactions":{"data":[],"summary":{"total_count":12}},
                    "comments":{"data":[],"summary":{"total_count":3}},
                    "shares":{"count":5},
                    "insights":{"data":[
                        {"name":"post_impressions","values":[{"value":400}]},
                        {"name":"post_impressions_unique","values":[{"value":200}]}
                    ]},
                    "id":"123_456"
                }"#,
            )
            .create_async()
            .await;

        let metrics = adapter(&server).fetch_metrics("page-token", "123_456").await.unwrap();
        assert_eq!(metrics.likes, 12);
        assert_eq!(metrics.comments, 3);
        assert_eq!(metrics.shares, 5);
        assert_eq!(metrics.views, 400);
        assert_eq!(metrics.reach, 200);
        assert!((metrics.engagement - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reply_requires_recipient() {
        let server = mockito::Server::new_async().await;
        let request = ReplyRequest {
            conversation_id: "t_1".to_string(),
            recipient_id: None,
            content: "Thanks!".to_string(),
        };
        let error = adapter(&server).reply("page-token", &request).await.unwrap_err();
        assert!(error.is_permanent());
    }

    #[tokio::test]
    async fn test_reply_sends_message() {
        let mut server = mockito::Server::new_async().await;
        let send = server
            .mock("POST", "/me/messages")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "recipient": {"id": "u_9"},
                "message": {"text": "Thanks!"}
            })))
            .with_body(r#"{"recipient_id":"u_9","message_id":"mid.1"}"#)
            .create_async()
            .await;

        let request = ReplyRequest {
            conversation_id: "t_1".to_string(),
            recipient_id: Some("u_9".to_string()),
            content: "Thanks!".to_string(),
        };
        let result = adapter(&server).reply("page-token", &request).await.unwrap();
        send.assert_async().await;
        assert_eq!(result.external_message_id, "mid.1");
    }

    #[test]
    fn test_webhook_without_secret_is_rejected() {
        let adapter = FacebookAdapter::new(None).unwrap();
        let header = webhook::sign_hex("anything", b"{}");
        assert!(!adapter.verify_webhook_signature(b"{}", &header).unwrap());
    }
}
