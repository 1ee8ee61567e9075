use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

pub mod events;
pub mod redis_pubsub;

pub use events::{ChatEvent, EventEnvelope};

/// Logical realtime channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// All active participants of a chat
    Chat(Uuid),
    /// One user, for cross-chat summaries
    User(Uuid),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Chat(id) => write!(f, "chat:{}", id),
            Channel::User(id) => write!(f, "user:{}", id),
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid channel: {}", s))?;
        let id = Uuid::parse_str(id).map_err(|e| format!("Invalid channel id: {}", e))?;
        match kind {
            "chat" => Ok(Channel::Chat(id)),
            "user" => Ok(Channel::User(id)),
            _ => Err(format!("Unknown channel kind: {}", kind)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("Failed to serialize event: {0}")]
    Serialization(String),

    #[error("Failed to publish: {0}")]
    Transport(String),
}

impl From<serde_json::Error> for FanoutError {
    fn from(e: serde_json::Error) -> Self {
        FanoutError::Serialization(e.to_string())
    }
}

/// Publish-subscribe transport for realtime events. No delivery
/// acknowledgement is expected from subscribers.
#[async_trait]
pub trait RealtimeFanout: Send + Sync {
    async fn publish(&self, channel: &Channel, event: &ChatEvent) -> Result<(), FanoutError>;
}

/// Publish and swallow failures; committed state never depends on fanout.
pub async fn publish_best_effort(fanout: &dyn RealtimeFanout, channel: Channel, event: ChatEvent) {
    if let Err(e) = fanout.publish(&channel, &event).await {
        tracing::warn!(
            error = %e,
            channel = %channel,
            event_type = event.event_type(),
            "Realtime publish failed"
        );
    }
}

/// Unique identifier for a realtime subscriber
///
/// Each connection gets a unique subscriber ID when it registers.
/// This allows for precise cleanup when connections close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<String>,
}

/// In-process registry of channel subscribers
///
/// Locking is per channel entry, so publishes to different chats or users
/// never contend. Supports precise cleanup using subscriber IDs to prevent
/// memory leaks.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<DashMap<Channel, Vec<Subscriber>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the subscriber id (for cleanup) and the receiving end of the
    /// subscription, which yields JSON envelopes.
    pub fn add_subscriber(&self, channel: Channel) -> (SubscriberId, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        let subscriber_id = SubscriberId::new();

        let mut subscribers = self.inner.entry(channel).or_default();
        subscribers.push(Subscriber {
            id: subscriber_id,
            sender: tx,
        });

        tracing::debug!(
            "Added subscriber {:?} to {}, total subscribers: {}",
            subscriber_id,
            channel,
            subscribers.len()
        );

        (subscriber_id, rx)
    }

    /// Must be called when a connection closes.
    pub fn remove_subscriber(&self, channel: Channel, subscriber_id: SubscriberId) {
        if let Some(mut subscribers) = self.inner.get_mut(&channel) {
            subscribers.retain(|s| s.id != subscriber_id);
        }
        if self
            .inner
            .remove_if(&channel, |_, subscribers| subscribers.is_empty())
            .is_some()
        {
            tracing::debug!("Removed empty channel {} from registry", channel);
        }
    }

    /// Broadcast to all subscribers of a channel, dropping dead ones.
    pub fn broadcast(&self, channel: Channel, msg: String) {
        let remaining = match self.inner.get_mut(&channel) {
            Some(mut subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|subscriber| subscriber.sender.send(msg.clone()).is_ok());

                let after = subscribers.len();
                if before != after {
                    tracing::debug!(
                        "Broadcast to {}: {} dead senders cleaned up, {} active",
                        channel,
                        before - after,
                        after
                    );
                }
                after
            }
            None => return,
        };
        if remaining == 0 {
            self.inner
                .remove_if(&channel, |_, subscribers| subscribers.is_empty());
        }
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.inner.get(&channel).map(|v| v.len()).unwrap_or(0)
    }
}

#[async_trait]
impl RealtimeFanout for ConnectionRegistry {
    async fn publish(&self, channel: &Channel, event: &ChatEvent) -> Result<(), FanoutError> {
        let payload = EventEnvelope::new(channel, event.clone()).to_json()?;
        self.broadcast(*channel, payload);
        Ok(())
    }
}
