//! Publish one post item to its platform
//!
//! Item states move `PENDING -> PUBLISHING -> {PUBLISHED | FAILED}`. A
//! published item is never published again: redelivered jobs for it only
//! repeat the sibling check. The parent post flips to `PUBLISHED` only when a re-read of
//! every sibling shows them all published, and to `FAILED` as soon as any
//! one attempt fails.

use secrecy::ExposeSecret;
use tokio::time::Instant;

use super::{account_key, WorkerContext};
use crate::error::{PlatformError, Result, SyndicastError};
use crate::jobs::PublishJob;
use crate::platforms::{PublishRequest, PublishResult};
use crate::realtime::{Envelope, EventType, PostStatusPayload};
use crate::types::{PostItem, PostItemStatus, PostItemWithAccount, PostStatus, SocialAccount};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The item was already published; nothing was sent
    AlreadyPublished { external_post_id: Option<String> },
    Published {
        external_post_id: String,
        /// Whether this completion flipped the parent post to PUBLISHED
        post_published: bool,
    },
}

pub async fn publish_item(ctx: &WorkerContext, job: &PublishJob) -> Result<PublishOutcome> {
    let deadline = Instant::now() + ctx.publish_timeout;

    let Some(PostItemWithAccount { item, account }) =
        ctx.db.get_post_item_with_account(&job.post_item_id).await?
    else {
        return Err(SyndicastError::not_found("post item", &job.post_item_id));
    };

    if item.status == PostItemStatus::Published {
        tracing::info!(
            post_item_id = %item.id,
            platform = %item.platform,
            "Post item already published, skipping"
        );
        // The earlier delivery may have stopped before the sibling re-check
        refresh_post_status(ctx, &item).await?;
        return Ok(PublishOutcome::AlreadyPublished {
            external_post_id: item.external_post_id,
        });
    }

    let Some(account) = account else {
        let error = SyndicastError::not_found("social account", &item.social_account_id);
        record_failure(ctx, &item, &job.brand_id, &error).await;
        return Err(error);
    };

    // Nothing has been attempted yet, so a throttled job leaves the item as it was
    ctx.limiters.publish.consume(&account_key(&account)).await?;

    let result = match attempt(ctx, &item, &account, deadline).await {
        Ok(result) => result,
        Err(error) => {
            record_failure(ctx, &item, &account.brand_id, &error).await;
            return Err(error);
        }
    };

    tracing::info!(
        post_item_id = %item.id,
        platform = %item.platform,
        external_post_id = %result.external_post_id,
        "Post item published"
    );

    let post_published = refresh_post_status(ctx, &item).await?;
    let post_status = if post_published {
        PostStatus::Published
    } else {
        current_post_status(ctx, &item.post_id).await
    };

    let details = serde_json::json!({
        "postId": item.post_id,
        "platform": item.platform,
        "externalPostId": result.external_post_id,
        "url": result.url,
    });
    if let Err(e) = ctx
        .db
        .record_audit(&account.brand_id, "post.published", "post_item", &item.id, &details)
        .await
    {
        tracing::warn!(post_item_id = %item.id, error = %e, "Failed to record audit entry");
    }

    ctx.notify(
        &account.brand_id,
        Envelope::new(
            EventType::PostStatusChanged,
            &PostStatusPayload {
                post_id: item.post_id.clone(),
                post_item_id: item.id.clone(),
                platform: item.platform,
                status: PostItemStatus::Published,
                post_status,
                external_post_id: Some(result.external_post_id.clone()),
                failure_reason: None,
            },
        ),
    )
    .await;

    Ok(PublishOutcome::Published {
        external_post_id: result.external_post_id,
        post_published,
    })
}

/// Move the item through `PUBLISHING` and persist the platform result.
///
/// The platform call is cut off at `deadline`. Every error returned here
/// leaves the item unpublished.
async fn attempt(
    ctx: &WorkerContext,
    item: &PostItem,
    account: &SocialAccount,
    deadline: Instant,
) -> Result<PublishResult> {
    ctx.db.set_item_status(&item.id, PostItemStatus::Publishing).await?;
    ctx.db.mark_post_publishing(&item.post_id).await?;

    tracing::info!(
        post_item_id = %item.id,
        post_id = %item.post_id,
        platform = %item.platform,
        "Publishing post item"
    );

    let result = tokio::time::timeout_at(deadline, send(ctx, item, account))
        .await
        .map_err(|_| PlatformError::Timeout {
            platform: item.platform,
            message: format!(
                "publish did not finish within {}",
                humantime::format_duration(ctx.publish_timeout)
            ),
        })??;

    let mut metadata = item.metadata.clone();
    metadata.extend(result.metadata.clone());
    if let Some(url) = &result.url {
        metadata.insert("url".to_string(), url.clone().into());
    }
    ctx.db
        .mark_item_published(&item.id, &result.external_post_id, result.published_at, &metadata)
        .await?;
    Ok(result)
}

async fn send(ctx: &WorkerContext, item: &PostItem, account: &SocialAccount) -> Result<PublishResult> {
    if !account.is_active {
        return Err(SyndicastError::InvalidInput(format!(
            "social account {} is disconnected",
            account.id
        )));
    }

    let token = ctx.access_token(account).await?;
    let adapter = ctx.adapters.get(item.platform);
    let result = adapter
        .publish(token.expose_secret(), &PublishRequest::from_item(item))
        .await?;

    if result.external_post_id.trim().is_empty() {
        return Err(PlatformError::Validation {
            platform: item.platform,
            message: "publish succeeded without an external post id".to_string(),
        }
        .into());
    }
    Ok(result)
}

/// Re-read the siblings and flip the post once all of them are published
async fn refresh_post_status(ctx: &WorkerContext, item: &PostItem) -> Result<bool> {
    let siblings = ctx.db.list_post_items(&item.post_id).await?;
    let all_published = !siblings.is_empty()
        && siblings
            .iter()
            .all(|sibling| sibling.status == PostItemStatus::Published);

    if !all_published {
        return Ok(false);
    }

    let flipped = ctx
        .db
        .mark_post_published(&item.post_id, chrono::Utc::now().timestamp())
        .await?;
    if flipped {
        tracing::info!(
            post_id = %item.post_id,
            items = siblings.len(),
            "All post items published"
        );
    }
    Ok(flipped)
}

async fn current_post_status(ctx: &WorkerContext, post_id: &str) -> PostStatus {
    match ctx.db.get_post(post_id).await {
        Ok(Some(post)) => post.status,
        Ok(None) => PostStatus::Publishing,
        Err(e) => {
            tracing::warn!(post_id = %post_id, error = %e, "Failed to read post status");
            PostStatus::Publishing
        }
    }
}

/// Persist the failure on the item and its post, then notify.
///
/// Persistence errors here are logged: the caller returns the original error.
async fn record_failure(ctx: &WorkerContext, item: &PostItem, brand_id: &str, error: &SyndicastError) {
    let reason = error.to_string();

    tracing::warn!(
        post_item_id = %item.id,
        platform = %item.platform,
        permanent = error.is_permanent(),
        error = %reason,
        "Post item failed to publish"
    );

    if let Err(e) = ctx.db.mark_item_failed(&item.id, &reason).await {
        tracing::error!(post_item_id = %item.id, error = %e, "Failed to persist item failure");
    }
    if let Err(e) = ctx.db.update_post_status(&item.post_id, PostStatus::Failed).await {
        tracing::error!(post_id = %item.post_id, error = %e, "Failed to persist post failure");
    }

    ctx.notify(
        brand_id,
        Envelope::new(
            EventType::PostStatusChanged,
            &PostStatusPayload {
                post_id: item.post_id.clone(),
                post_item_id: item.id.clone(),
                platform: item.platform,
                status: PostItemStatus::Failed,
                post_status: PostStatus::Failed,
                external_post_id: None,
                failure_reason: Some(reason),
            },
        ),
    )
    .await;
}
