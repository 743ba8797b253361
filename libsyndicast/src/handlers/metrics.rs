//! Refresh engagement metrics for published items

use secrecy::{ExposeSecret, SecretString};

use super::{account_key, WorkerContext};
use crate::db::AccountProfileUpdate;
use crate::error::{Result, SyndicastError};
use crate::jobs::MetricsJob;
use crate::platforms::PlatformAdapter;
use crate::realtime::{Envelope, EventType, MetricsPayload};
use crate::types::{PostItem, PostMetrics, SocialAccount};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsOutcome {
    pub updated: usize,
    pub failed: usize,
}

pub async fn refresh_metrics(ctx: &WorkerContext, job: &MetricsJob) -> Result<MetricsOutcome> {
    match (&job.post_item_id, &job.social_account_id) {
        (Some(item_id), _) => refresh_item(ctx, item_id).await,
        (None, Some(account_id)) => refresh_account(ctx, account_id).await,
        (None, None) => Err(SyndicastError::InvalidPayload(
            "metrics job needs postItemId or socialAccountId".to_string(),
        )),
    }
}

async fn refresh_item(ctx: &WorkerContext, item_id: &str) -> Result<MetricsOutcome> {
    let entry = ctx
        .db
        .get_post_item_with_account(item_id)
        .await?
        .ok_or_else(|| SyndicastError::not_found("post item", item_id))?;
    let account = entry
        .account
        .ok_or_else(|| SyndicastError::not_found("social account", &entry.item.social_account_id))?;

    let token = ctx.access_token(&account).await?;
    let adapter = ctx.adapters.get(account.platform);
    fetch_and_store(ctx, adapter.as_ref(), &token, &account, &entry.item).await?;

    Ok(MetricsOutcome {
        updated: 1,
        failed: 0,
    })
}

/// Refresh the most recent published items of an account, isolating failures
async fn refresh_account(ctx: &WorkerContext, account_id: &str) -> Result<MetricsOutcome> {
    let account = ctx
        .db
        .get_account(account_id)
        .await?
        .ok_or_else(|| SyndicastError::not_found("social account", account_id))?;

    if !account.is_active {
        tracing::info!(social_account_id = %account.id, "Account is disconnected, skipping metrics");
        return Ok(MetricsOutcome::default());
    }

    let token = ctx.access_token(&account).await?;
    let adapter = ctx.adapters.get(account.platform);

    refresh_profile(ctx, adapter.as_ref(), &token, &account).await;

    let items = ctx
        .db
        .list_published_items_for_account(&account.id, ctx.metrics_batch_size)
        .await?;

    let mut outcome = MetricsOutcome::default();
    // One platform call in flight per account
    for item in &items {
        match fetch_and_store(ctx, adapter.as_ref(), &token, &account, item).await {
            Ok(()) => outcome.updated += 1,
            Err(e) => {
                outcome.failed += 1;
                tracing::warn!(
                    post_item_id = %item.id,
                    platform = %account.platform,
                    error = %e,
                    "Failed to refresh metrics, continuing batch"
                );
            }
        }
    }

    tracing::info!(
        social_account_id = %account.id,
        platform = %account.platform,
        updated = outcome.updated,
        failed = outcome.failed,
        "Account metrics refreshed"
    );
    Ok(outcome)
}

async fn fetch_and_store(
    ctx: &WorkerContext,
    adapter: &dyn PlatformAdapter,
    token: &SecretString,
    account: &SocialAccount,
    item: &PostItem,
) -> Result<()> {
    let external_id = item.external_post_id.as_deref().ok_or_else(|| {
        SyndicastError::InvalidInput(format!("post item {} has not been published", item.id))
    })?;

    ctx.limiters.api.consume(&account_key(account)).await?;
    let snapshot = adapter.fetch_metrics(token.expose_secret(), external_id).await?;

    let metrics = PostMetrics {
        post_item_id: item.id.clone(),
        likes: snapshot.likes,
        comments: snapshot.comments,
        shares: snapshot.shares,
        views: snapshot.views,
        reach: snapshot.reach,
        engagement_rate: snapshot.engagement,
        saves: snapshot.saves,
        fetched_at: chrono::Utc::now().timestamp(),
    };
    ctx.db.upsert_post_metrics(&metrics).await?;

    ctx.notify(
        &account.brand_id,
        Envelope::new(
            EventType::MetricsUpdated,
            &MetricsPayload {
                post_item_id: item.id.clone(),
                likes: metrics.likes,
                comments: metrics.comments,
                shares: metrics.shares,
                views: metrics.views,
                reach: metrics.reach,
                engagement_rate: metrics.engagement_rate,
            },
        ),
    )
    .await;
    Ok(())
}

/// Best-effort refresh of the account's profile fields
async fn refresh_profile(
    ctx: &WorkerContext,
    adapter: &dyn PlatformAdapter,
    token: &SecretString,
    account: &SocialAccount,
) {
    let info = match adapter.get_account(token.expose_secret()).await {
        Ok(info) => info,
        Err(e) => {
            tracing::debug!(social_account_id = %account.id, error = %e, "Profile refresh skipped");
            return;
        }
    };

    let update = AccountProfileUpdate {
        username: info.username.as_deref(),
        display_name: info.display_name.as_deref(),
        avatar_url: info.avatar_url.as_deref(),
        follower_count: info.follower_count,
    };
    if let Err(e) = ctx.db.update_account_profile(&account.id, &update).await {
        tracing::warn!(social_account_id = %account.id, error = %e, "Failed to store profile");
    }
}
