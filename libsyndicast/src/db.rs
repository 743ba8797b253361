//! Database operations for Syndicast

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::{DbError, Result};
use crate::types::{
    Conversation, Message, Platform, Post, PostItem, PostItemStatus, PostItemWithAccount,
    PostMetrics, PostStatus, SocialAccount,
};

/// Profile fields refreshed from the platform. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct AccountProfileUpdate<'a> {
    pub username: Option<&'a str>,
    pub display_name: Option<&'a str>,
    pub avatar_url: Option<&'a str>,
    pub follower_count: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub brand_id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: serde_json::Value,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

fn parse_column<T>(row: &SqliteRow, column: &'static str) -> Result<T>
where
    T: FromStr<Err = String>,
{
    row.get::<String, _>(column)
        .parse()
        .map_err(|message| DbError::Decode { column, message }.into())
}

fn json_column<T>(row: &SqliteRow, column: &'static str) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_str(&row.get::<String, _>(column)).map_err(|e| {
        DbError::Decode {
            column,
            message: e.to_string(),
        }
        .into()
    })
}

fn encode_json<T: serde::Serialize>(value: &T, column: &'static str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        DbError::Decode {
            column,
            message: e.to_string(),
        }
        .into()
    })
}

const ACCOUNT_COLUMNS: &str = "id, brand_id, platform, external_account_id, username, display_name, \
                               avatar_url, follower_count, encrypted_access_token, is_active, \
                               last_sync_at, created_at";

fn account_from_row(row: &SqliteRow) -> Result<SocialAccount> {
    Ok(SocialAccount {
        id: row.get("id"),
        brand_id: row.get("brand_id"),
        platform: parse_column(row, "platform")?,
        external_account_id: row.get("external_account_id"),
        username: row.get("username"),
        display_name: row.get("display_name"),
        avatar_url: row.get("avatar_url"),
        follower_count: row.get("follower_count"),
        encrypted_access_token: row.get("encrypted_access_token"),
        is_active: row.get::<i64, _>("is_active") != 0,
        last_sync_at: row.get("last_sync_at"),
        created_at: row.get("created_at"),
    })
}

fn post_from_row(row: &SqliteRow) -> Result<Post> {
    Ok(Post {
        id: row.get("id"),
        brand_id: row.get("brand_id"),
        status: parse_column(row, "status")?,
        scheduled_at: row.get("scheduled_at"),
        published_at: row.get("published_at"),
        created_at: row.get("created_at"),
    })
}

const ITEM_COLUMNS: &str = "id, post_id, platform, social_account_id, content, media_urls, hashtags, \
                            metadata, status, external_post_id, failure_reason, published_at";

fn item_from_row(row: &SqliteRow) -> Result<PostItem> {
    Ok(PostItem {
        id: row.get("id"),
        post_id: row.get("post_id"),
        platform: parse_column(row, "platform")?,
        social_account_id: row.get("social_account_id"),
        content: row.get("content"),
        media_urls: json_column(row, "media_urls")?,
        hashtags: json_column(row, "hashtags")?,
        metadata: json_column(row, "metadata")?,
        status: parse_column(row, "status")?,
        external_post_id: row.get("external_post_id"),
        failure_reason: row.get("failure_reason"),
        published_at: row.get("published_at"),
    })
}

const CONVERSATION_COLUMNS: &str = "id, brand_id, social_account_id, platform, external_id, kind, \
                                    participant_id, participant_name, status, priority, \
                                    unread_count, last_message_at, created_at, updated_at";

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.get("id"),
        brand_id: row.get("brand_id"),
        social_account_id: row.get("social_account_id"),
        platform: parse_column(row, "platform")?,
        external_id: row.get("external_id"),
        kind: parse_column(row, "kind")?,
        participant_id: row.get("participant_id"),
        participant_name: row.get("participant_name"),
        status: parse_column(row, "status")?,
        priority: parse_column(row, "priority")?,
        unread_count: row.get("unread_count"),
        last_message_at: row.get("last_message_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        platform: parse_column(row, "platform")?,
        external_id: row.get("external_id"),
        direction: parse_column(row, "direction")?,
        sender_id: row.get("sender_id"),
        sender_name: row.get("sender_name"),
        content: row.get("content"),
        sent_at: row.get("sent_at"),
        created_at: row.get("created_at"),
    })
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- Social accounts ----

    pub async fn create_account(&self, account: &SocialAccount) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO social_accounts (id, brand_id, platform, external_account_id, username,
                display_name, avatar_url, follower_count, encrypted_access_token, is_active,
                last_sync_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.brand_id)
        .bind(account.platform.as_str())
        .bind(&account.external_account_id)
        .bind(&account.username)
        .bind(&account.display_name)
        .bind(&account.avatar_url)
        .bind(account.follower_count)
        .bind(&account.encrypted_access_token)
        .bind(account.is_active)
        .bind(account.last_sync_at)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<SocialAccount>> {
        let sql = format!("SELECT {} FROM social_accounts WHERE id = ?", ACCOUNT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(account_from_row).transpose()
    }

    /// Active accounts, optionally restricted to one platform
    pub async fn list_active_accounts(&self, platform: Option<Platform>) -> Result<Vec<SocialAccount>> {
        let sql = format!(
            "SELECT {} FROM social_accounts WHERE is_active = 1 AND (?1 IS NULL OR platform = ?1) \
             ORDER BY created_at, id",
            ACCOUNT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(platform.map(|p| p.as_str()))
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(account_from_row).collect()
    }

    pub async fn update_account_profile(
        &self,
        account_id: &str,
        profile: &AccountProfileUpdate<'_>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE social_accounts SET
                username = COALESCE(?, username),
                display_name = COALESCE(?, display_name),
                avatar_url = COALESCE(?, avatar_url),
                follower_count = COALESCE(?, follower_count)
            WHERE id = ?
            "#,
        )
        .bind(profile.username)
        .bind(profile.display_name)
        .bind(profile.avatar_url)
        .bind(profile.follower_count)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn set_account_last_sync(&self, account_id: &str, synced_at: i64) -> Result<()> {
        sqlx::query("UPDATE social_accounts SET last_sync_at = ? WHERE id = ?")
            .bind(synced_at)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Accounts are deactivated on disconnect, never deleted
    pub async fn deactivate_account(&self, account_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE social_accounts SET is_active = 0 WHERE id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() > 0)
    }

    // ---- Posts ----

    pub async fn create_post(&self, post: &Post) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, brand_id, status, scheduled_at, published_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.brand_id)
        .bind(post.status.as_str())
        .bind(post.scheduled_at)
        .bind(post.published_at)
        .bind(post.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, brand_id, status, scheduled_at, published_at, created_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(post_from_row).transpose()
    }

    pub async fn update_post_status(&self, post_id: &str, status: PostStatus) -> Result<()> {
        sqlx::query("UPDATE posts SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Move a draft or scheduled post to PUBLISHING. Returns whether it moved.
    pub async fn mark_post_publishing(&self, post_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'PUBLISHING'
            WHERE id = ? AND status IN ('DRAFT', 'SCHEDULED')
            "#,
        )
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() > 0)
    }

    /// Flip a post to PUBLISHED once. Concurrent callers see exactly one `true`.
    pub async fn mark_post_published(&self, post_id: &str, published_at: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'PUBLISHED', published_at = ?
            WHERE id = ? AND status != 'PUBLISHED'
            "#,
        )
        .bind(published_at)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() > 0)
    }

    // ---- Post items ----

    pub async fn create_post_item(&self, item: &PostItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO post_items (id, post_id, platform, social_account_id, content, media_urls,
                hashtags, metadata, status, external_post_id, failure_reason, published_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.post_id)
        .bind(item.platform.as_str())
        .bind(&item.social_account_id)
        .bind(&item.content)
        .bind(encode_json(&item.media_urls, "post_items.media_urls")?)
        .bind(encode_json(&item.hashtags, "post_items.hashtags")?)
        .bind(encode_json(&item.metadata, "post_items.metadata")?)
        .bind(item.status.as_str())
        .bind(&item.external_post_id)
        .bind(&item.failure_reason)
        .bind(item.published_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_post_item(&self, item_id: &str) -> Result<Option<PostItem>> {
        let sql = format!("SELECT {} FROM post_items WHERE id = ?", ITEM_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(item_from_row).transpose()
    }

    /// Load an item and the account it publishes through
    pub async fn get_post_item_with_account(
        &self,
        item_id: &str,
    ) -> Result<Option<PostItemWithAccount>> {
        let Some(item) = self.get_post_item(item_id).await? else {
            return Ok(None);
        };
        let account = self.get_account(&item.social_account_id).await?;
        Ok(Some(PostItemWithAccount { item, account }))
    }

    /// All platform renditions of a post
    pub async fn list_post_items(&self, post_id: &str) -> Result<Vec<PostItem>> {
        let sql = format!(
            "SELECT {} FROM post_items WHERE post_id = ? ORDER BY rowid",
            ITEM_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(item_from_row).collect()
    }

    pub async fn set_item_status(&self, item_id: &str, status: PostItemStatus) -> Result<()> {
        sqlx::query("UPDATE post_items SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn mark_item_published(
        &self,
        item_id: &str,
        external_post_id: &str,
        published_at: i64,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE post_items
            SET status = 'PUBLISHED', external_post_id = ?, published_at = ?, metadata = ?,
                failure_reason = NULL
            WHERE id = ?
            "#,
        )
        .bind(external_post_id)
        .bind(published_at)
        .bind(encode_json(metadata, "post_items.metadata")?)
        .bind(item_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Record a failed attempt. A published item keeps its status and external id.
    pub async fn mark_item_failed(&self, item_id: &str, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE post_items SET status = 'FAILED', failure_reason = ? \
             WHERE id = ? AND status != 'PUBLISHED'",
        )
            .bind(reason)
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Most recently published items of an account that have an external id
    pub async fn list_published_items_for_account(
        &self,
        account_id: &str,
        limit: u32,
    ) -> Result<Vec<PostItem>> {
        let sql = format!(
            r#"
            SELECT {} FROM post_items
            WHERE social_account_id = ? AND status = 'PUBLISHED' AND external_post_id IS NOT NULL
            ORDER BY published_at DESC, rowid DESC
            LIMIT ?
            "#,
            ITEM_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(item_from_row).collect()
    }

    // ---- Metrics ----

    /// Replace the snapshot for an item
    pub async fn upsert_post_metrics(&self, metrics: &PostMetrics) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO post_metrics (post_item_id, likes, comments, shares, views, reach,
                engagement_rate, saves, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(post_item_id) DO UPDATE SET
                likes = excluded.likes,
                comments = excluded.comments,
                shares = excluded.shares,
                views = excluded.views,
                reach = excluded.reach,
                engagement_rate = excluded.engagement_rate,
                saves = excluded.saves,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&metrics.post_item_id)
        .bind(metrics.likes)
        .bind(metrics.comments)
        .bind(metrics.shares)
        .bind(metrics.views)
        .bind(metrics.reach)
        .bind(metrics.engagement_rate)
        .bind(metrics.saves)
        .bind(metrics.fetched_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn get_post_metrics(&self, item_id: &str) -> Result<Option<PostMetrics>> {
        let row = sqlx::query(
            r#"
            SELECT post_item_id, likes, comments, shares, views, reach, engagement_rate, saves,
                fetched_at
            FROM post_metrics WHERE post_item_id = ?
            "#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| PostMetrics {
            post_item_id: r.get("post_item_id"),
            likes: r.get("likes"),
            comments: r.get("comments"),
            shares: r.get("shares"),
            views: r.get("views"),
            reach: r.get("reach"),
            engagement_rate: r.get("engagement_rate"),
            saves: r.get("saves"),
            fetched_at: r.get("fetched_at"),
        }))
    }

    // ---- Inbox ----

    /// Insert a conversation or refresh an existing one on `(platform, external_id)`.
    ///
    /// An existing row keeps its status, priority and unread count; only
    /// `last_message_at` (never moving backwards) and `updated_at` change.
    /// Returns the stored row.
    pub async fn upsert_conversation(&self, conversation: &Conversation) -> Result<Conversation> {
        let sql = format!(
            r#"
            INSERT INTO conversations (id, brand_id, social_account_id, platform, external_id, kind,
                participant_id, participant_name, status, priority, unread_count, last_message_at,
                created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(platform, external_id) DO UPDATE SET
                last_message_at = MAX(conversations.last_message_at, excluded.last_message_at),
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            CONVERSATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&conversation.id)
            .bind(&conversation.brand_id)
            .bind(&conversation.social_account_id)
            .bind(conversation.platform.as_str())
            .bind(&conversation.external_id)
            .bind(conversation.kind.as_str())
            .bind(&conversation.participant_id)
            .bind(&conversation.participant_name)
            .bind(conversation.status.as_str())
            .bind(conversation.priority.as_str())
            .bind(conversation.unread_count)
            .bind(conversation.last_message_at)
            .bind(conversation.created_at)
            .bind(conversation.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        conversation_from_row(&row)
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let sql = format!("SELECT {} FROM conversations WHERE id = ?", CONVERSATION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Update the user-facing triage fields of a conversation
    pub async fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: crate::types::ConversationStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE conversations SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(chrono::Utc::now().timestamp())
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn increment_unread(&self, conversation_id: &str, updated_at: i64) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET unread_count = unread_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(updated_at)
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Advance `last_message_at` after an outbound reply
    pub async fn touch_conversation(&self, conversation_id: &str, message_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_at = MAX(last_message_at, ?1), updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(message_at)
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Append a message. Returns false when `(platform, external_id)` already exists.
    pub async fn insert_message(&self, message: &Message) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, platform, external_id, direction, sender_id,
                sender_name, content, sent_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(platform, external_id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.platform.as_str())
        .bind(&message.external_id)
        .bind(message.direction.as_str())
        .bind(&message.sender_id)
        .bind(&message.sender_name)
        .bind(&message.content)
        .bind(message.sent_at)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, platform, external_id, direction, sender_id, sender_name,
                content, sent_at, created_at
            FROM messages WHERE conversation_id = ?
            ORDER BY sent_at, rowid
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(message_from_row).collect()
    }

    // ---- Audit log ----

    pub async fn record_audit(
        &self,
        brand_id: &str,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        details: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (brand_id, action, entity_type, entity_id, details, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(brand_id)
        .bind(action)
        .bind(entity_type)
        .bind(entity_id)
        .bind(encode_json(details, "audit_logs.details")?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn list_audit_entries(&self, entity_id: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, brand_id, action, entity_type, entity_id, details, created_at
            FROM audit_logs WHERE entity_id = ?
            ORDER BY id
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                Ok(AuditEntry {
                    id: r.get("id"),
                    brand_id: r.get("brand_id"),
                    action: r.get("action"),
                    entity_type: r.get("entity_type"),
                    entity_id: r.get("entity_id"),
                    details: json_column(r, "details")?,
                    created_at: r.get("created_at"),
                })
            })
            .collect()
    }
}
