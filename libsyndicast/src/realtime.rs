//! Realtime fan-out of pipeline state changes
//!
//! Handlers publish an [`Envelope`] to a per-brand channel (`brand:{id}`)
//! through a [`Notifier`]. Delivery is best-effort: a notifier never reports
//! failure to its caller, and persisted state never depends on it.
//!
//! # Example
//!
//! ```
//! use libsyndicast::realtime::{EventBus, Envelope, EventType, Notifier};
//!
//! # async fn example() {
//! let bus = EventBus::new(100);
//! let mut inbox = bus.subscribe_brand("brand-1");
//!
//! bus.notify("brand-1", Envelope::new(EventType::MetricsUpdated, &serde_json::json!({}))).await;
//!
//! if let Some(envelope) = inbox.recv().await {
//!     println!("{}", envelope.event_type);
//! }
//! # }
//! ```

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{Platform, PostItemStatus, PostStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "post.status_changed")]
    PostStatusChanged,
    #[serde(rename = "inbox.new_message")]
    InboxNewMessage,
    #[serde(rename = "inbox.conversation_updated")]
    InboxConversationUpdated,
    #[serde(rename = "metrics.updated")]
    MetricsUpdated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PostStatusChanged => "post.status_changed",
            EventType::InboxNewMessage => "inbox.new_message",
            EventType::InboxConversationUpdated => "inbox.conversation_updated",
            EventType::MetricsUpdated => "metrics.updated",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope: `{ "type": ..., "payload": ..., "timestamp": ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    /// Unix milliseconds
    pub timestamp: i64,
}

impl Envelope {
    pub fn new<P: Serialize>(event_type: EventType, payload: &P) -> Self {
        let payload = serde_json::to_value(payload).unwrap_or_else(|e| {
            tracing::warn!(event = %event_type, error = %e, "Failed to serialize event payload");
            serde_json::Value::Null
        });
        Self {
            event_type,
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostStatusPayload {
    pub post_id: String,
    pub post_item_id: String,
    pub platform: Platform,
    pub status: PostItemStatus,
    /// Parent post status after this transition
    pub post_status: PostStatus,
    pub external_post_id: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub conversation_id: String,
    pub message_id: String,
    pub platform: Platform,
    pub sender_name: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub conversation_id: String,
    pub platform: Platform,
    pub last_message_at: i64,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPayload {
    pub post_item_id: String,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub views: i64,
    pub reach: i64,
    pub engagement_rate: f64,
}

pub fn brand_channel(brand_id: &str) -> String {
    format!("brand:{}", brand_id)
}

/// Best-effort publisher of realtime events
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, brand_id: &str, envelope: Envelope);
}

/// Drops every event, for deployments without a realtime transport
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, brand_id: &str, envelope: Envelope) {
        tracing::trace!(brand_id = %brand_id, event = %envelope.event_type, "Realtime event dropped");
    }
}

/// An envelope addressed to one logical channel
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub channel: String,
    pub envelope: Envelope,
}

pub type EventReceiver = broadcast::Receiver<ChannelEvent>;

/// In-process event bus over a broadcast channel.
///
/// With no subscribers, events are dropped immediately. Lagging
/// subscribers lose the oldest events rather than blocking emitters.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChannelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Every event on every channel
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Events on one brand's channel
    pub fn subscribe_brand(&self, brand_id: &str) -> BrandReceiver {
        BrandReceiver {
            channel: brand_channel(brand_id),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn emit(&self, channel: String, envelope: Envelope) {
        // Err only means nobody is listening
        let _ = self.sender.send(ChannelEvent { channel, envelope });
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Notifier for EventBus {
    async fn notify(&self, brand_id: &str, envelope: Envelope) {
        self.emit(brand_channel(brand_id), envelope);
    }
}

pub struct BrandReceiver {
    channel: String,
    receiver: EventReceiver,
}

impl BrandReceiver {
    /// Next envelope for this brand, or `None` once the bus is dropped
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.channel == self.channel => return Some(event.envelope),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %self.channel, skipped, "Realtime subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Envelopes already queued for this brand, without waiting
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.channel == self.channel => envelopes.push(event.envelope),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return envelopes,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::new(
            EventType::PostStatusChanged,
            &PostStatusPayload {
                post_id: "p1".to_string(),
                post_item_id: "i1".to_string(),
                platform: Platform::Instagram,
                status: PostItemStatus::Published,
                post_status: PostStatus::Published,
                external_post_id: Some("ig_123".to_string()),
                failure_reason: None,
            },
        );

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "post.status_changed");
        assert_eq!(json["payload"]["postItemId"], "i1");
        assert_eq!(json["payload"]["externalPostId"], "ig_123");
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_brand_channels_are_isolated() {
        let bus = EventBus::new(10);
        let mut brand_a = bus.subscribe_brand("a");
        let mut brand_b = bus.subscribe_brand("b");

        bus.notify("b", Envelope::new(EventType::MetricsUpdated, &serde_json::json!({"n": 1})))
            .await;
        bus.notify("a", Envelope::new(EventType::InboxNewMessage, &serde_json::json!({"n": 2})))
            .await;

        let received = brand_a.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::InboxNewMessage);
        assert_eq!(brand_b.drain().len(), 1);
        assert!(brand_a.drain().is_empty());
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        bus.notify("a", Envelope::new(EventType::MetricsUpdated, &())).await;

        let receiver = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(receiver);
    }

    #[tokio::test]
    async fn test_noop_notifier() {
        NoopNotifier
            .notify("a", Envelope::new(EventType::MetricsUpdated, &()))
            .await;
    }

    #[tokio::test]
    async fn test_closed_bus_ends_subscription() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe_brand("a");
        drop(bus);
        assert!(receiver.recv().await.is_none());
    }
}
