//! Inbox polling, deduplication and replies

mod common;

use std::sync::Arc;

use common::{of_type, Harness, BRAND};
use libsyndicast::handlers::{poll_inbox, send_reply};
use libsyndicast::jobs::InboxPollJob;
use libsyndicast::platforms::mock::{MockAdapter, MockConfig};
use libsyndicast::platforms::InboxMessage;
use libsyndicast::realtime::EventType;
use libsyndicast::types::{ConversationKind, ConversationStatus, MessageDirection};
use libsyndicast::{Platform, SocialAccount, SyndicastError};

fn message(id: &str, sender: &str, content: &str, sent_at: i64) -> InboxMessage {
    InboxMessage {
        conversation_external_id: "ig-thread-1".to_string(),
        message_external_id: id.to_string(),
        kind: ConversationKind::DirectMessage,
        sender_id: Some(sender.to_string()),
        sender_name: Some(format!("{} name", sender)),
        content: content.to_string(),
        sent_at,
    }
}

fn poll_job(account: &SocialAccount) -> InboxPollJob {
    InboxPollJob {
        social_account_id: account.id.clone(),
        brand_id: BRAND.to_string(),
        platform: account.platform,
    }
}

/// An Instagram mock with two inbound messages and one sent by the account itself
fn instagram_inbox() -> Arc<MockAdapter> {
    let config = MockConfig::for_platform(Platform::Instagram);
    config.push_inbox_message(message("m1", "fan-1", "love this", 1_700_000_010));
    config.push_inbox_message(message("m2", "ig-1", "thank you!", 1_700_000_020));
    config.push_inbox_message(message("m3", "fan-1", "where can I buy it?", 1_700_000_030));
    Arc::new(MockAdapter::new(config))
}

#[tokio::test]
async fn test_repoll_inserts_no_duplicates_and_keeps_triage() {
    let h = Harness::new().await;
    let instagram = instagram_inbox();
    let ctx = h.context(vec![instagram.clone()]);
    let mut events = h.subscribe();

    let account = h.account(Platform::Instagram, "ig-1").await;

    let first = poll_inbox(&ctx, &poll_job(&account)).await.unwrap();
    assert_eq!(first.fetched, 3);
    assert_eq!(first.inserted, 3);
    assert_eq!(first.duplicates, 0);

    let envelopes = events.drain();
    let new_messages = of_type(&envelopes, EventType::InboxNewMessage);
    assert_eq!(new_messages.len(), 3);
    let conversation_id = new_messages[0].payload["conversationId"]
        .as_str()
        .unwrap()
        .to_string();

    let conversation = h.db.get_conversation(&conversation_id).await.unwrap().unwrap();
    assert_eq!(conversation.unread_count, 2);
    assert_eq!(conversation.last_message_at, 1_700_000_030);
    assert_eq!(conversation.participant_id.as_deref(), Some("fan-1"));

    let messages = h.db.list_messages(&conversation_id).await.unwrap();
    let directions: Vec<_> = messages.iter().map(|m| m.direction).collect();
    assert_eq!(
        directions,
        vec![
            MessageDirection::Inbound,
            MessageDirection::Outbound,
            MessageDirection::Inbound
        ]
    );

    h.db.set_conversation_status(&conversation_id, ConversationStatus::Resolved)
        .await
        .unwrap();

    // Rewind the cursor so the same window is fetched again
    h.db.set_account_last_sync(&account.id, 0).await.unwrap();
    let second = poll_inbox(&ctx, &poll_job(&account)).await.unwrap();
    assert_eq!(second.fetched, 3);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.duplicates, 3);
    assert!(events.drain().is_empty());

    let conversation = h.db.get_conversation(&conversation_id).await.unwrap().unwrap();
    assert_eq!(conversation.status, ConversationStatus::Resolved);
    assert_eq!(conversation.unread_count, 2);
    assert_eq!(h.db.list_messages(&conversation_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_poll_advances_the_sync_cursor() {
    let h = Harness::new().await;
    let instagram = instagram_inbox();
    let ctx = h.context(vec![instagram.clone()]);

    let account = h.account(Platform::Instagram, "ig-1").await;
    assert!(account.last_sync_at.is_none());

    poll_inbox(&ctx, &poll_job(&account)).await.unwrap();
    let synced = h.db.get_account(&account.id).await.unwrap().unwrap();
    let cursor = synced.last_sync_at.unwrap();
    assert!(cursor > 1_700_000_030);

    // Messages older than the cursor are not fetched again
    let again = poll_inbox(&ctx, &poll_job(&account)).await.unwrap();
    assert_eq!(again.fetched, 0);
    assert_eq!(instagram.config().inbox_call_count(), 2);
}

#[tokio::test]
async fn test_platform_mismatch_is_invalid_payload() {
    let h = Harness::new().await;
    let ctx = h.context(vec![instagram_inbox()]);
    let account = h.account(Platform::Instagram, "ig-1").await;

    let mut job = poll_job(&account);
    job.platform = Platform::Facebook;
    match poll_inbox(&ctx, &job).await {
        Err(SyndicastError::InvalidPayload(_)) => {}
        other => panic!("Expected InvalidPayload, got {:?}", other),
    }
}

#[tokio::test]
async fn test_platform_without_inbox_is_not_implemented() {
    let h = Harness::new().await;
    let ctx = h.context(vec![]);
    let account = h.account(Platform::TikTok, "tt-1").await;

    let error = poll_inbox(&ctx, &poll_job(&account)).await.unwrap_err();
    assert!(error.is_permanent());
}

#[tokio::test]
async fn test_reply_records_outbound_message() {
    let h = Harness::new().await;
    let instagram = instagram_inbox();
    let ctx = h.context(vec![instagram.clone()]);
    let mut events = h.subscribe();

    let account = h.account(Platform::Instagram, "ig-1").await;
    poll_inbox(&ctx, &poll_job(&account)).await.unwrap();
    let conversation_id = of_type(&events.drain(), EventType::InboxConversationUpdated)[0].payload
        ["conversationId"]
        .as_str()
        .unwrap()
        .to_string();

    let reply = send_reply(&ctx, &conversation_id, "It ships next week").await.unwrap();
    assert_eq!(reply.direction, MessageDirection::Outbound);
    assert_eq!(reply.sender_id.as_deref(), Some("ig-1"));

    let sent = instagram.config().replies();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].conversation_id, "ig-thread-1");
    assert_eq!(sent[0].recipient_id.as_deref(), Some("fan-1"));

    assert_eq!(h.db.list_messages(&conversation_id).await.unwrap().len(), 4);
    let updates = events.drain();
    assert_eq!(of_type(&updates, EventType::InboxConversationUpdated).len(), 1);
}

#[tokio::test]
async fn test_empty_reply_is_rejected() {
    let h = Harness::new().await;
    let ctx = h.context(vec![instagram_inbox()]);

    match send_reply(&ctx, "any-conversation", "   ").await {
        Err(SyndicastError::InvalidInput(_)) => {}
        other => panic!("Expected InvalidInput, got {:?}", other),
    }
}
