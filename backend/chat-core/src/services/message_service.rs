use crate::config::ChatConfig;
use crate::error::{AppError, AppResult};
use crate::fanout::{publish_best_effort, Channel, ChatEvent, RealtimeFanout};
use crate::models::message::DELETED_PREVIEW;
use crate::models::{
    Chat, ChatType, DeleteScope, LastMessage, Message, MessageContent, MessageCursor,
    MessagePage, MessageStatus, MessageType, MessageView, PageAnchor, PageRequest, Reaction,
    SendMessageRequest,
};
use crate::services::conversation_service::require_active;
use crate::services::directory::UserDirectory;
use crate::services::moderation::ModerationGateway;
use crate::services::notification::{self, NotificationGateway, NotificationKind, NotificationRequest};
use crate::services::unread_tracker::UnreadTracker;
use crate::store::{ChatStore, MessageMutation, MessageStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_EMOJI_LENGTH: usize = 32;

/// Message pipeline: send, edit, delete, reactions, delivery receipts and history
pub struct MessageService {
    chats: Arc<dyn ChatStore>,
    messages: Arc<dyn MessageStore>,
    unread: UnreadTracker,
    moderation: Arc<dyn ModerationGateway>,
    directory: Arc<dyn UserDirectory>,
    notifier: Arc<dyn NotificationGateway>,
    fanout: Arc<dyn RealtimeFanout>,
    config: Arc<ChatConfig>,
}

impl MessageService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chats: Arc<dyn ChatStore>,
        messages: Arc<dyn MessageStore>,
        unread: UnreadTracker,
        moderation: Arc<dyn ModerationGateway>,
        directory: Arc<dyn UserDirectory>,
        notifier: Arc<dyn NotificationGateway>,
        fanout: Arc<dyn RealtimeFanout>,
        config: Arc<ChatConfig>,
    ) -> Self {
        Self {
            chats,
            messages,
            unread,
            moderation,
            directory,
            notifier,
            fanout,
            config,
        }
    }

    /// Validate, moderate and persist a message, then update the chat's
    /// last-message cache, recipients' unread counts and realtime channels.
    ///
    /// The returned message has `status = sent`. Nothing is persisted when
    /// validation or moderation fails.
    pub async fn send_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        request: SendMessageRequest,
    ) -> AppResult<Message> {
        let accepted_at = Utc::now();

        let chat = self.load_chat(chat_id).await?;
        let sender = require_active(&chat, sender_id)?;
        if let Some(info) = chat.group_info.as_ref() {
            if !info.permissions.send_messages.allows(sender.role) {
                return Err(AppError::PermissionDenied(
                    "only admins can send messages in this group".into(),
                ));
            }
        }

        request
            .content
            .validate(request.message_type, self.config.max_text_length)?;
        if let Some(reply_to) = request.reply_to {
            if self.messages.get_message(chat_id, reply_to).await?.is_none() {
                return Err(AppError::InvalidContent(format!(
                    "reply target {} is not a message of this chat",
                    reply_to
                )));
            }
        }

        let content = self.moderate(request.content, sender_id).await?;

        let message = self
            .messages
            .append_message(Message::new(
                chat_id,
                sender_id,
                content,
                request.reply_to,
                request.forwarded_from,
                accepted_at,
            ))
            .await?;

        let preview = message.preview(self.config.preview_length);
        let last = LastMessage {
            message_id: message.id,
            preview: preview.clone(),
            sender_id,
            message_type: message.message_type,
            timestamp: message.created_at,
        };
        match self.chats.update_last_message_if_newer(chat_id, last).await {
            Ok(false) => debug!(chat_id = %chat_id, message_id = %message.id, "Newer last message already cached"),
            Ok(true) => self.reconcile_cached_preview(chat_id, message.id, &preview).await,
            Err(e) => warn!(chat_id = %chat_id, error = %e, "Failed to update last message cache"),
        }

        // Re-read membership after the commit so participants who joined in
        // between are considered; the store skips anyone whose cursor already
        // covers this message.
        let members = self.load_chat(chat_id).await.unwrap_or(chat);
        let recipients: Vec<Uuid> = members
            .active_member_ids()
            .into_iter()
            .filter(|id| *id != sender_id)
            .collect();
        let counts = self
            .unread
            .record_message(chat_id, &recipients, message.seq)
            .await;

        info!(
            chat_id = %chat_id,
            message_id = %message.id,
            seq = message.seq,
            message_type = %message.message_type,
            recipients = recipients.len(),
            "Message sent"
        );

        self.publish(
            Channel::Chat(chat_id),
            ChatEvent::NewMessage {
                message: MessageView::from(&message),
            },
        )
        .await;
        self.publish(
            Channel::User(sender_id),
            ChatEvent::StatusCreated {
                chat_id,
                message_id: message.id,
                status: message.status,
                created_at: message.created_at,
            },
        )
        .await;
        for (user_id, unread_count) in counts {
            self.publish(
                Channel::User(user_id),
                ChatEvent::UnreadUpdated {
                    chat_id,
                    unread_count,
                },
            )
            .await;
        }

        self.notify_recipients(&members, &message).await;
        Ok(message)
    }

    /// Replace the text of the sender's own text message
    pub async fn edit_message(
        &self,
        chat_id: Uuid,
        editor_id: Uuid,
        message_id: Uuid,
        content: MessageContent,
    ) -> AppResult<Message> {
        let chat = self.load_chat(chat_id).await?;
        require_active(&chat, editor_id)?;
        let original = self.load_message(chat_id, message_id, editor_id).await?;

        if original.sender_id != editor_id {
            return Err(AppError::PermissionDenied(
                "only the sender can edit a message".into(),
            ));
        }
        if original.is_deleted {
            return Err(AppError::BadRequest("deleted messages cannot be edited".into()));
        }
        if original.message_type != MessageType::Text {
            return Err(AppError::InvalidContent(
                "only text messages can be edited".into(),
            ));
        }
        content.validate(MessageType::Text, self.config.max_text_length)?;
        let content = self.moderate(content, editor_id).await?;

        let (message, changed) = self
            .messages
            .apply_message_mutation(
                chat_id,
                message_id,
                MessageMutation::Edit {
                    content,
                    at: Utc::now(),
                },
            )
            .await?;
        if !changed {
            return Ok(message);
        }

        self.refresh_preview(chat_id, &message, message.preview(self.config.preview_length))
            .await;
        self.publish(
            Channel::Chat(chat_id),
            ChatEvent::MessageEdited {
                message: MessageView::from(&message),
            },
        )
        .await;
        Ok(message)
    }

    /// `ForEveryone` tombstones the message (sender or group admin only);
    /// `ForMe` hides it from the requester's history.
    pub async fn delete_message(
        &self,
        chat_id: Uuid,
        requester_id: Uuid,
        message_id: Uuid,
        scope: DeleteScope,
    ) -> AppResult<()> {
        let chat = self.load_chat(chat_id).await?;
        let requester = require_active(&chat, requester_id)?;
        let message = self.load_message(chat_id, message_id, requester_id).await?;

        match scope {
            DeleteScope::ForEveryone => {
                let is_group_admin =
                    chat.chat_type == ChatType::Group && requester.role.is_privileged();
                if message.sender_id != requester_id && !is_group_admin {
                    return Err(AppError::PermissionDenied(
                        "only the sender or a group admin can delete for everyone".into(),
                    ));
                }

                let (message, changed) = self
                    .messages
                    .apply_message_mutation(
                        chat_id,
                        message_id,
                        MessageMutation::Tombstone { at: Utc::now() },
                    )
                    .await?;
                if changed {
                    info!(chat_id = %chat_id, message_id = %message_id, "Message deleted for everyone");
                    self.refresh_preview(chat_id, &message, DELETED_PREVIEW.to_string())
                        .await;
                    self.publish(
                        Channel::Chat(chat_id),
                        ChatEvent::MessageDeleted {
                            chat_id,
                            message_id,
                            deleted_by: requester_id,
                        },
                    )
                    .await;
                }
            }
            DeleteScope::ForMe => {
                let (_, changed) = self
                    .messages
                    .apply_message_mutation(
                        chat_id,
                        message_id,
                        MessageMutation::HideFor {
                            user_id: requester_id,
                        },
                    )
                    .await?;
                if changed {
                    let reset = self.unread.acknowledge(chat_id, requester_id, None).await?;
                    if reset.changed() {
                        self.publish(
                            Channel::User(requester_id),
                            ChatEvent::UnreadUpdated {
                                chat_id,
                                unread_count: reset.unread_count,
                            },
                        )
                        .await;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn add_reaction(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
        emoji: &str,
    ) -> AppResult<Message> {
        let emoji = validate_emoji(emoji)?;
        let chat = self.load_chat(chat_id).await?;
        require_active(&chat, user_id)?;
        let message = self.load_message(chat_id, message_id, user_id).await?;
        if message.is_deleted {
            return Err(AppError::InvalidContent(
                "cannot react to a deleted message".into(),
            ));
        }

        let (message, changed) = self
            .messages
            .apply_message_mutation(
                chat_id,
                message_id,
                MessageMutation::AddReaction(Reaction {
                    user_id,
                    emoji: emoji.clone(),
                    created_at: Utc::now(),
                }),
            )
            .await?;
        if changed {
            self.publish(
                Channel::Chat(chat_id),
                ChatEvent::ReactionAdded {
                    chat_id,
                    message_id,
                    user_id,
                    emoji,
                },
            )
            .await;
        }
        Ok(message)
    }

    pub async fn remove_reaction(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
        emoji: &str,
    ) -> AppResult<Message> {
        let emoji = validate_emoji(emoji)?;
        let chat = self.load_chat(chat_id).await?;
        require_active(&chat, user_id)?;
        self.load_message(chat_id, message_id, user_id).await?;

        let (message, changed) = self
            .messages
            .apply_message_mutation(
                chat_id,
                message_id,
                MessageMutation::RemoveReaction {
                    user_id,
                    emoji: emoji.clone(),
                },
            )
            .await?;
        if changed {
            self.publish(
                Channel::Chat(chat_id),
                ChatEvent::ReactionRemoved {
                    chat_id,
                    message_id,
                    user_id,
                    emoji,
                },
            )
            .await;
        }
        Ok(message)
    }

    /// Advance messages from others to `delivered`. Returns the ids that moved;
    /// messages already delivered or read are left as they are.
    pub async fn mark_delivered(
        &self,
        chat_id: Uuid,
        recipient_id: Uuid,
        message_ids: &[Uuid],
    ) -> AppResult<Vec<Uuid>> {
        let chat = self.load_chat(chat_id).await?;
        require_active(&chat, recipient_id)?;

        let mut delivered = Vec::new();
        for &message_id in message_ids {
            let message = match self.messages.get_message(chat_id, message_id).await? {
                Some(m) if m.sender_id != recipient_id => m,
                _ => continue,
            };
            if message.status >= MessageStatus::Delivered {
                continue;
            }

            let now = Utc::now();
            let (_, changed) = self
                .messages
                .apply_message_mutation(
                    chat_id,
                    message_id,
                    MessageMutation::AdvanceStatus {
                        next: MessageStatus::Delivered,
                        at: now,
                    },
                )
                .await?;
            if changed {
                delivered.push(message_id);
                self.publish(
                    Channel::Chat(chat_id),
                    ChatEvent::MessageDelivered {
                        chat_id,
                        message_id,
                        recipient_id,
                        delivered_at: now,
                    },
                )
                .await;
            }
        }
        Ok(delivered)
    }

    pub async fn get_message(
        &self,
        chat_id: Uuid,
        requester_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<MessageView> {
        let chat = self.load_chat(chat_id).await?;
        require_active(&chat, requester_id)?;
        let message = self.load_message(chat_id, message_id, requester_id).await?;
        Ok(MessageView::from(&message))
    }

    /// One page of history, oldest first. Tombstones are included; messages
    /// the requester deleted for themselves are not.
    pub async fn get_chat_messages(
        &self,
        chat_id: Uuid,
        requester_id: Uuid,
        page: PageRequest,
    ) -> AppResult<MessagePage> {
        let chat = self.load_chat(chat_id).await?;
        require_active(&chat, requester_id)?;

        let anchor = PageAnchor::from_request(&page)?;
        let limit = page
            .limit
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size);

        let (messages, has_more) = self
            .messages
            .page(chat_id, requester_id, anchor, limit)
            .await?;

        Ok(MessagePage {
            prev_cursor: messages.first().map(|m| MessageCursor::of(m).encode()),
            next_cursor: messages.last().map(|m| MessageCursor::of(m).encode()),
            messages: messages
                .iter()
                .filter_map(|m| m.view_for(requester_id))
                .collect(),
            has_more,
        })
    }

    async fn moderate(&self, content: MessageContent, author_id: Uuid) -> AppResult<MessageContent> {
        let text = match content.moderation_text() {
            Some(text) => text.to_owned(),
            None => return Ok(content),
        };

        let verdict = self.moderation.moderate(&text, author_id).await?;
        if !verdict.approved {
            info!(author_id = %author_id, flags = ?verdict.flags, "Message rejected by moderation");
            return Err(AppError::ContentRejected {
                flags: verdict.flags,
            });
        }
        Ok(match verdict.cleaned_text {
            Some(cleaned) => content.with_cleaned_text(cleaned),
            None => content,
        })
    }

    async fn refresh_preview(&self, chat_id: Uuid, message: &Message, preview: String) {
        if let Err(e) = self
            .chats
            .refresh_last_message_preview(chat_id, message.id, preview)
            .await
        {
            warn!(chat_id = %chat_id, message_id = %message.id, error = %e, "Failed to refresh last message preview");
        }
    }

    /// An edit or delete that committed between the append and the cache write
    /// found the cache pointing elsewhere and skipped its refresh. Re-read the
    /// message now that it is cached and repair the preview.
    async fn reconcile_cached_preview(&self, chat_id: Uuid, message_id: Uuid, cached: &str) {
        let current = match self.messages.get_message(chat_id, message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                warn!(chat_id = %chat_id, message_id = %message_id, error = %e, "Failed to re-read sent message");
                return;
            }
        };
        let preview = current.preview(self.config.preview_length);
        if preview != cached {
            debug!(chat_id = %chat_id, message_id = %message_id, "Message changed while caching; refreshing preview");
            self.refresh_preview(chat_id, &current, preview).await;
        }
    }

    async fn notify_recipients(&self, chat: &Chat, message: &Message) {
        let now = Utc::now();
        let sender_name = self
            .directory
            .display_name(message.sender_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "Someone".to_string());
        let preview = message.preview(self.config.preview_length);

        let requests = chat
            .participants
            .iter()
            .filter(|p| p.is_active && p.user_id != message.sender_id && !p.is_muted_at(now))
            .map(|p| NotificationRequest {
                id: Uuid::new_v4(),
                kind: NotificationKind::NewMessage,
                chat_id: chat.id,
                recipient_id: p.user_id,
                sender_id: message.sender_id,
                sender_name: sender_name.clone(),
                message_id: Some(message.id),
                preview: preview.clone(),
                timestamp: now,
            })
            .collect();
        notification::dispatch(self.notifier.clone(), requests);
    }

    async fn load_chat(&self, chat_id: Uuid) -> AppResult<Chat> {
        self.chats
            .get_chat(chat_id)
            .await?
            .filter(|chat| !chat.is_deleted)
            .ok_or(AppError::ChatNotFound)
    }

    /// A message of the chat that `viewer` can see
    async fn load_message(&self, chat_id: Uuid, message_id: Uuid, viewer: Uuid) -> AppResult<Message> {
        self.messages
            .get_message(chat_id, message_id)
            .await?
            .filter(|m| m.is_visible_to(viewer))
            .ok_or(AppError::MessageNotFound)
    }

    async fn publish(&self, channel: Channel, event: ChatEvent) {
        publish_best_effort(self.fanout.as_ref(), channel, event).await;
    }
}

fn validate_emoji(emoji: &str) -> AppResult<String> {
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_LENGTH {
        return Err(AppError::InvalidContent(format!(
            "reaction must be 1..={} characters",
            MAX_EMOJI_LENGTH
        )));
    }
    Ok(emoji.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_emoji() {
        assert_eq!(validate_emoji(" 👍 ").unwrap(), "👍");
        assert!(validate_emoji("   ").is_err());
        assert!(validate_emoji(&"x".repeat(33)).is_err());
    }
}
