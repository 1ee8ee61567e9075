//! Realtime events
//!
//! Every payload published to a channel has the same top-level shape:
//! ```json
//! {
//!     "event_id": "uuid",
//!     "timestamp": "2025-10-26T10:30:00Z",
//!     "channel": "chat:<uuid>",
//!     "type": "new_message",
//!     ...event fields
//! }
//! ```
//! Delivery is at-least-once; clients dedupe by `event_id` or message id.

use super::Channel;
use crate::models::{ChatType, MemberRole, MessageStatus, MessageView};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// New message committed (chat channel)
    NewMessage { message: MessageView },

    /// Acknowledges the sender's message was persisted (sender's user channel)
    StatusCreated {
        chat_id: Uuid,
        message_id: Uuid,
        status: MessageStatus,
        created_at: DateTime<Utc>,
    },

    /// A reader advanced read receipts (chat channel)
    MessageRead {
        chat_id: Uuid,
        reader_id: Uuid,
        message_ids: Vec<Uuid>,
        last_seen_message_id: Option<Uuid>,
        read_at: DateTime<Utc>,
    },

    MessageDelivered {
        chat_id: Uuid,
        message_id: Uuid,
        recipient_id: Uuid,
        delivered_at: DateTime<Utc>,
    },

    MessageEdited { message: MessageView },

    MessageDeleted {
        chat_id: Uuid,
        message_id: Uuid,
        deleted_by: Uuid,
    },

    ReactionAdded {
        chat_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    ReactionRemoved {
        chat_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    /// Sent to each participant's user channel
    ChatCreated {
        chat_id: Uuid,
        chat_type: ChatType,
        created_by: Uuid,
        participant_ids: Vec<Uuid>,
    },

    MemberJoined {
        chat_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    },

    MemberLeft { chat_id: Uuid, user_id: Uuid },

    MemberRoleChanged {
        chat_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    },

    ChatUpdated {
        chat_id: Uuid,
        updated_fields: Vec<String>,
    },

    /// Per-user summary update (user channel)
    UnreadUpdated { chat_id: Uuid, unread_count: u64 },
}

impl ChatEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::StatusCreated { .. } => "status_created",
            Self::MessageRead { .. } => "message_read",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ReactionAdded { .. } => "reaction_added",
            Self::ReactionRemoved { .. } => "reaction_removed",
            Self::ChatCreated { .. } => "chat_created",
            Self::MemberJoined { .. } => "member_joined",
            Self::MemberLeft { .. } => "member_left",
            Self::MemberRoleChanged { .. } => "member_role_changed",
            Self::ChatUpdated { .. } => "chat_updated",
            Self::UnreadUpdated { .. } => "unread_updated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    #[serde(flatten)]
    pub event: ChatEvent,
}

impl EventEnvelope {
    pub fn new(channel: &Channel, event: ChatEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            channel: channel.to_string(),
            event,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tag_matches_event_type() {
        let events = vec![
            ChatEvent::UnreadUpdated {
                chat_id: Uuid::new_v4(),
                unread_count: 3,
            },
            ChatEvent::MemberLeft {
                chat_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            },
            ChatEvent::ChatUpdated {
                chat_id: Uuid::new_v4(),
                updated_fields: vec!["name".into()],
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.event_type());
        }
    }

    #[test]
    fn test_envelope_is_flat() {
        let chat_id = Uuid::new_v4();
        let channel = Channel::Chat(chat_id);
        let envelope = EventEnvelope::new(
            &channel,
            ChatEvent::MessageDeleted {
                chat_id,
                message_id: Uuid::new_v4(),
                deleted_by: Uuid::new_v4(),
            },
        );
        let json = envelope.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "message_deleted");
        assert_eq!(value["channel"], format!("chat:{}", chat_id));
        assert_eq!(value["chat_id"], chat_id.to_string());

        let parsed: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event.event_type(), "message_deleted");
    }
}
