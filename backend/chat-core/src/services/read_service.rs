use crate::error::{AppError, AppResult};
use crate::fanout::{publish_best_effort, Channel, ChatEvent, RealtimeFanout};
use crate::models::{Chat, Message, MessageStatus};
use crate::services::conversation_service::require_active;
use crate::services::unread_tracker::UnreadTracker;
use crate::store::{ChatStore, MessageMutation, MessageStore, ReadCursor};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Result of a read acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub chat_id: Uuid,
    pub reader_id: Uuid,
    /// Messages whose status moved to `read` in this call
    pub read_message_ids: Vec<Uuid>,
    pub last_seen_message_id: Option<Uuid>,
    pub unread_count: u64,
}

pub struct ReadService {
    chats: Arc<dyn ChatStore>,
    messages: Arc<dyn MessageStore>,
    unread: UnreadTracker,
    fanout: Arc<dyn RealtimeFanout>,
}

impl ReadService {
    pub fn new(
        chats: Arc<dyn ChatStore>,
        messages: Arc<dyn MessageStore>,
        unread: UnreadTracker,
        fanout: Arc<dyn RealtimeFanout>,
    ) -> Self {
        Self {
            chats,
            messages,
            unread,
            fanout,
        }
    }

    /// Mark the listed messages as read by `reader_id`, move the reader's
    /// cursor to the newest of them and recompute their unread count.
    ///
    /// Repeating a call is a no-op: nothing changes and nothing is published.
    pub async fn mark_messages_as_read(
        &self,
        chat_id: Uuid,
        reader_id: Uuid,
        message_ids: &[Uuid],
    ) -> AppResult<ReadReceipt> {
        let chat = self.load_chat(chat_id).await?;
        require_active(&chat, reader_id)?;
        let now = Utc::now();

        let mut seen = HashSet::new();
        let mut newest: Option<Message> = None;
        let mut read_message_ids = Vec::new();

        for &message_id in message_ids {
            if !seen.insert(message_id) {
                continue;
            }
            let message = match self.messages.get_message(chat_id, message_id).await? {
                Some(m) => m,
                None => {
                    debug!(chat_id = %chat_id, message_id = %message_id, "Skipping read ack for unknown message");
                    continue;
                }
            };

            if message.sender_id != reader_id && message.status < MessageStatus::Read {
                let (_, changed) = self
                    .messages
                    .apply_message_mutation(
                        chat_id,
                        message_id,
                        MessageMutation::AdvanceStatus {
                            next: MessageStatus::Read,
                            at: now,
                        },
                    )
                    .await?;
                if changed {
                    read_message_ids.push(message_id);
                }
            }

            if newest.as_ref().map_or(true, |n| message.seq > n.seq) {
                newest = Some(message);
            }
        }

        let cursor = newest.as_ref().map(|m| ReadCursor {
            message_id: m.id,
            seq: m.seq,
            at: now,
        });
        let reset = self.unread.acknowledge(chat_id, reader_id, cursor).await?;

        let last_seen_message_id = if reset.cursor_moved {
            newest.map(|m| m.id)
        } else {
            self.load_chat(chat_id)
                .await
                .ok()
                .and_then(|c| c.participant(reader_id).and_then(|p| p.last_seen_message_id))
        };

        if !read_message_ids.is_empty() || reset.cursor_moved {
            debug!(
                chat_id = %chat_id,
                reader_id = %reader_id,
                read = read_message_ids.len(),
                unread = reset.unread_count,
                "Messages marked as read"
            );
            publish_best_effort(
                self.fanout.as_ref(),
                Channel::Chat(chat_id),
                ChatEvent::MessageRead {
                    chat_id,
                    reader_id,
                    message_ids: read_message_ids.clone(),
                    last_seen_message_id,
                    read_at: now,
                },
            )
            .await;
        }
        if reset.changed() {
            publish_best_effort(
                self.fanout.as_ref(),
                Channel::User(reader_id),
                ChatEvent::UnreadUpdated {
                    chat_id,
                    unread_count: reset.unread_count,
                },
            )
            .await;
        }

        Ok(ReadReceipt {
            chat_id,
            reader_id,
            read_message_ids,
            last_seen_message_id,
            unread_count: reset.unread_count,
        })
    }

    async fn load_chat(&self, chat_id: Uuid) -> AppResult<Chat> {
        self.chats
            .get_chat(chat_id)
            .await?
            .filter(|chat| !chat.is_deleted)
            .ok_or(AppError::ChatNotFound)
    }
}
