//! Core types for Syndicast

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Platforms a brand can connect an account on.
///
/// Closed set: the adapter registry maps every variant to an adapter, so an
/// unknown platform is a parse error rather than a failed lookup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Facebook,
    X,
    LinkedIn,
    TikTok,
    YouTube,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Instagram,
        Platform::Facebook,
        Platform::X,
        Platform::LinkedIn,
        Platform::TikTok,
        Platform::YouTube,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Facebook => "facebook",
            Platform::X => "x",
            Platform::LinkedIn => "linkedin",
            Platform::TikTok => "tiktok",
            Platform::YouTube => "youtube",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "instagram" | "ig" => Ok(Platform::Instagram),
            "facebook" | "fb" => Ok(Platform::Facebook),
            "x" | "twitter" => Ok(Platform::X),
            "linkedin" => Ok(Platform::LinkedIn),
            "tiktok" => Ok(Platform::TikTok),
            "youtube" | "yt" => Ok(Platform::YouTube),
            _ => Err(format!("Unknown platform: '{}'", s)),
        }
    }
}

/// Aggregate status of a post across all of its platform items.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Publishing,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "DRAFT",
            PostStatus::Scheduled => "SCHEDULED",
            PostStatus::Publishing => "PUBLISHING",
            PostStatus::Published => "PUBLISHED",
            PostStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(PostStatus::Draft),
            "SCHEDULED" => Ok(PostStatus::Scheduled),
            "PUBLISHING" => Ok(PostStatus::Publishing),
            "PUBLISHED" => Ok(PostStatus::Published),
            "FAILED" => Ok(PostStatus::Failed),
            _ => Err(format!("Unknown post status: '{}'", s)),
        }
    }
}

/// Publication state of a single platform rendition.
///
/// `Published` and `Failed` are terminal for a given job; a failed item is
/// only retried by enqueueing a fresh publish job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostItemStatus {
    Pending,
    Publishing,
    Published,
    Failed,
}

impl PostItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostItemStatus::Pending => "PENDING",
            PostItemStatus::Publishing => "PUBLISHING",
            PostItemStatus::Published => "PUBLISHED",
            PostItemStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for PostItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PostItemStatus::Pending),
            "PUBLISHING" => Ok(PostItemStatus::Publishing),
            "PUBLISHED" => Ok(PostItemStatus::Published),
            "FAILED" => Ok(PostItemStatus::Failed),
            _ => Err(format!("Unknown post item status: '{}'", s)),
        }
    }
}

impl fmt::Display for PostItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One connected account on one platform for one brand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialAccount {
    pub id: String,
    pub brand_id: String,
    pub platform: Platform,
    pub external_account_id: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub follower_count: Option<i64>,
    /// Credential blob produced by [`crate::vault::CredentialVault::encrypt`]
    #[serde(skip_serializing)]
    pub encrypted_access_token: String,
    pub is_active: bool,
    pub last_sync_at: Option<i64>,
    pub created_at: i64,
}

impl SocialAccount {
    pub fn new(
        brand_id: impl Into<String>,
        platform: Platform,
        external_account_id: impl Into<String>,
        encrypted_access_token: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            brand_id: brand_id.into(),
            platform,
            external_account_id: external_account_id.into(),
            username: None,
            display_name: None,
            avatar_url: None,
            follower_count: None,
            encrypted_access_token,
            is_active: true,
            last_sync_at: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub brand_id: String,
    pub status: PostStatus,
    pub scheduled_at: Option<i64>,
    pub published_at: Option<i64>,
    pub created_at: i64,
}

impl Post {
    pub fn new(brand_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            brand_id: brand_id.into(),
            status: PostStatus::Scheduled,
            scheduled_at: None,
            published_at: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostItem {
    pub id: String,
    pub post_id: String,
    pub platform: Platform,
    pub social_account_id: String,
    pub content: String,
    pub media_urls: Vec<String>,
    pub hashtags: Vec<String>,
    /// Free-form platform metadata; publish results are merged in
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: PostItemStatus,
    pub external_post_id: Option<String>,
    pub failure_reason: Option<String>,
    pub published_at: Option<i64>,
}

impl PostItem {
    pub fn new(post: &Post, account: &SocialAccount, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            post_id: post.id.clone(),
            platform: account.platform,
            social_account_id: account.id.clone(),
            content: content.into(),
            media_urls: Vec::new(),
            hashtags: Vec::new(),
            metadata: serde_json::Map::new(),
            status: PostItemStatus::Pending,
            external_post_id: None,
            failure_reason: None,
            published_at: None,
        }
    }

    pub fn with_media(mut self, urls: Vec<String>) -> Self {
        self.media_urls = urls;
        self
    }

    pub fn with_hashtags(mut self, hashtags: Vec<String>) -> Self {
        self.hashtags = hashtags;
        self
    }
}

/// A post item loaded together with the account it publishes through.
#[derive(Debug, Clone)]
pub struct PostItemWithAccount {
    pub item: PostItem,
    pub account: Option<SocialAccount>,
}

/// Latest engagement snapshot for one post item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostMetrics {
    pub post_item_id: String,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub views: i64,
    pub reach: i64,
    pub engagement_rate: f64,
    pub saves: Option<i64>,
    pub fetched_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationKind {
    DirectMessage,
    Comment,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::DirectMessage => "DIRECT_MESSAGE",
            ConversationKind::Comment => "COMMENT",
        }
    }
}

impl FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DIRECT_MESSAGE" => Ok(ConversationKind::DirectMessage),
            "COMMENT" => Ok(ConversationKind::Comment),
            _ => Err(format!("Unknown conversation kind: '{}'", s)),
        }
    }
}

/// Triage status set by users; inbox polling never overwrites it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Open,
    Pending,
    Resolved,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "OPEN",
            ConversationStatus::Pending => "PENDING",
            ConversationStatus::Resolved => "RESOLVED",
            ConversationStatus::Archived => "ARCHIVED",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(ConversationStatus::Open),
            "PENDING" => Ok(ConversationStatus::Pending),
            "RESOLVED" => Ok(ConversationStatus::Resolved),
            "ARCHIVED" => Ok(ConversationStatus::Archived),
            _ => Err(format!("Unknown conversation status: '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Priority::Low),
            "NORMAL" => Ok(Priority::Normal),
            "HIGH" => Ok(Priority::High),
            "URGENT" => Ok(Priority::Urgent),
            _ => Err(format!("Unknown priority: '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub brand_id: String,
    pub social_account_id: String,
    pub platform: Platform,
    pub external_id: String,
    pub kind: ConversationKind,
    pub participant_id: Option<String>,
    pub participant_name: Option<String>,
    pub status: ConversationStatus,
    pub priority: Priority,
    pub unread_count: i64,
    pub last_message_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Inbound => "INBOUND",
            MessageDirection::Outbound => "OUTBOUND",
        }
    }
}

impl FromStr for MessageDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INBOUND" => Ok(MessageDirection::Inbound),
            "OUTBOUND" => Ok(MessageDirection::Outbound),
            _ => Err(format!("Unknown message direction: '{}'", s)),
        }
    }
}

/// Messages are append-only; `(platform, external_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub platform: Platform,
    pub external_id: String,
    pub direction: MessageDirection,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub content: String,
    pub sent_at: i64,
    pub created_at: i64,
}
