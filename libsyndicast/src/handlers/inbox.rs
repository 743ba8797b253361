//! Inbox polling and replies
//!
//! Conversations and messages are keyed by `(platform, external_id)`, so
//! overlapping polls are idempotent. Polling refreshes only a
//! conversation's timestamps; triage fields set by users stay untouched.

use secrecy::ExposeSecret;
use uuid::Uuid;

use super::{account_key, WorkerContext};
use crate::error::{PlatformError, Result, SyndicastError};
use crate::jobs::InboxPollJob;
use crate::platforms::{InboxMessage, ReplyRequest};
use crate::realtime::{ConversationPayload, Envelope, EventType, NewMessagePayload};
use crate::types::{
    Conversation, ConversationStatus, Message, MessageDirection, Priority, SocialAccount,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboxOutcome {
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

pub async fn poll_inbox(ctx: &WorkerContext, job: &InboxPollJob) -> Result<InboxOutcome> {
    let account = ctx
        .db
        .get_account(&job.social_account_id)
        .await?
        .ok_or_else(|| SyndicastError::not_found("social account", &job.social_account_id))?;

    if account.platform != job.platform {
        return Err(SyndicastError::InvalidPayload(format!(
            "account {} is on {}, job names {}",
            account.id, account.platform, job.platform
        )));
    }
    if !account.is_active {
        tracing::info!(social_account_id = %account.id, "Account is disconnected, skipping inbox poll");
        return Ok(InboxOutcome::default());
    }

    let adapter = ctx.adapters.get(account.platform);
    if !adapter.supports_inbox() {
        return Err(PlatformError::NotImplemented {
            platform: account.platform,
            capability: "inbox",
        }
        .into());
    }

    let token = ctx.access_token(&account).await?;
    ctx.limiters.api.consume(&account_key(&account)).await?;

    let polled_at = chrono::Utc::now().timestamp();
    let messages = adapter
        .fetch_inbox_messages(token.expose_secret(), account.last_sync_at)
        .await?;

    let mut outcome = InboxOutcome {
        fetched: messages.len(),
        ..Default::default()
    };
    for message in &messages {
        match store_message(ctx, &account, message).await {
            Ok(true) => outcome.inserted += 1,
            Ok(false) => outcome.duplicates += 1,
            Err(e) => {
                outcome.failed += 1;
                tracing::warn!(
                    social_account_id = %account.id,
                    message_id = %message.message_external_id,
                    error = %e,
                    "Failed to store inbox message, continuing"
                );
            }
        }
    }

    ctx.db.set_account_last_sync(&account.id, polled_at).await?;

    tracing::info!(
        social_account_id = %account.id,
        platform = %account.platform,
        fetched = outcome.fetched,
        inserted = outcome.inserted,
        duplicates = outcome.duplicates,
        failed = outcome.failed,
        "Inbox polled"
    );
    Ok(outcome)
}

/// Upsert the conversation and append the message. Returns whether it was new.
async fn store_message(
    ctx: &WorkerContext,
    account: &SocialAccount,
    incoming: &InboxMessage,
) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let direction = match &incoming.sender_id {
        Some(sender) if *sender == account.external_account_id => MessageDirection::Outbound,
        _ => MessageDirection::Inbound,
    };
    let inbound = direction == MessageDirection::Inbound;

    let conversation = ctx
        .db
        .upsert_conversation(&Conversation {
            id: Uuid::new_v4().to_string(),
            brand_id: account.brand_id.clone(),
            social_account_id: account.id.clone(),
            platform: account.platform,
            external_id: incoming.conversation_external_id.clone(),
            kind: incoming.kind,
            participant_id: incoming.sender_id.clone().filter(|_| inbound),
            participant_name: incoming.sender_name.clone().filter(|_| inbound),
            status: ConversationStatus::Open,
            priority: Priority::Normal,
            unread_count: 0,
            last_message_at: incoming.sent_at,
            created_at: now,
            updated_at: now,
        })
        .await?;

    let message = Message {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation.id.clone(),
        platform: account.platform,
        external_id: incoming.message_external_id.clone(),
        direction,
        sender_id: incoming.sender_id.clone(),
        sender_name: incoming.sender_name.clone(),
        content: incoming.content.clone(),
        sent_at: incoming.sent_at,
        created_at: now,
    };
    if !ctx.db.insert_message(&message).await? {
        return Ok(false);
    }

    let mut unread_count = conversation.unread_count;
    if inbound {
        ctx.db.increment_unread(&conversation.id, now).await?;
        unread_count += 1;
    }

    ctx.notify(
        &account.brand_id,
        Envelope::new(
            EventType::InboxNewMessage,
            &NewMessagePayload {
                conversation_id: conversation.id.clone(),
                message_id: message.id.clone(),
                platform: account.platform,
                sender_name: message.sender_name.clone(),
                content: message.content.clone(),
            },
        ),
    )
    .await;
    ctx.notify(
        &account.brand_id,
        Envelope::new(
            EventType::InboxConversationUpdated,
            &ConversationPayload {
                conversation_id: conversation.id,
                platform: account.platform,
                last_message_at: conversation.last_message_at,
                unread_count,
            },
        ),
    )
    .await;

    Ok(true)
}

/// Reply on a conversation through the platform and record the outbound message
pub async fn send_reply(ctx: &WorkerContext, conversation_id: &str, content: &str) -> Result<Message> {
    if content.trim().is_empty() {
        return Err(SyndicastError::InvalidInput("reply content is empty".to_string()));
    }

    let conversation = ctx
        .db
        .get_conversation(conversation_id)
        .await?
        .ok_or_else(|| SyndicastError::not_found("conversation", conversation_id))?;
    let account = ctx
        .db
        .get_account(&conversation.social_account_id)
        .await?
        .ok_or_else(|| SyndicastError::not_found("social account", &conversation.social_account_id))?;

    let adapter = ctx.adapters.get(conversation.platform);
    if !adapter.supports_reply() {
        return Err(PlatformError::NotImplemented {
            platform: conversation.platform,
            capability: "reply",
        }
        .into());
    }

    let token = ctx.access_token(&account).await?;
    ctx.limiters.api.consume(&account_key(&account)).await?;

    let sent = adapter
        .reply(
            token.expose_secret(),
            &ReplyRequest {
                conversation_id: conversation.external_id.clone(),
                recipient_id: conversation.participant_id.clone(),
                content: content.to_string(),
            },
        )
        .await?;

    let message = Message {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation.id.clone(),
        platform: conversation.platform,
        external_id: sent.external_message_id,
        direction: MessageDirection::Outbound,
        sender_id: Some(account.external_account_id.clone()),
        sender_name: account.username.clone(),
        content: content.to_string(),
        sent_at: sent.created_at,
        created_at: chrono::Utc::now().timestamp(),
    };
    ctx.db.insert_message(&message).await?;
    ctx.db.touch_conversation(&conversation.id, message.sent_at).await?;

    tracing::info!(
        conversation_id = %conversation.id,
        platform = %conversation.platform,
        "Reply sent"
    );

    ctx.notify(
        &account.brand_id,
        Envelope::new(
            EventType::InboxConversationUpdated,
            &ConversationPayload {
                conversation_id: conversation.id,
                platform: conversation.platform,
                last_message_at: conversation.last_message_at.max(message.sent_at),
                unread_count: conversation.unread_count,
            },
        ),
    )
    .await;

    Ok(message)
}
