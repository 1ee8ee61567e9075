use crate::config::ChatConfig;
use crate::error::{AppError, AppResult};
use crate::fanout::{publish_best_effort, Channel, ChatEvent, RealtimeFanout};
use crate::models::{
    Chat, ChatSettings, ChatSummary, ChatType, GroupInfo, GroupInfoPatch, GroupPermissions,
    MemberRole, Participant,
};
use crate::services::directory::UserDirectory;
use crate::services::notification::{self, NotificationGateway, NotificationKind, NotificationRequest};
use crate::store::{ChatMutation, ChatStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_GROUP_NAME: &str = "New group";

/// Details for creating a group chat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewGroup {
    pub name: String,
    pub description: Option<String>,
    pub avatar: Option<String>,
    pub member_ids: Vec<Uuid>,
    pub permissions: Option<GroupPermissions>,
}

/// Chat lifecycle, membership and per-viewer preferences
pub struct ConversationService {
    chats: Arc<dyn ChatStore>,
    directory: Arc<dyn UserDirectory>,
    notifier: Arc<dyn NotificationGateway>,
    fanout: Arc<dyn RealtimeFanout>,
    config: Arc<ChatConfig>,
}

impl ConversationService {
    pub fn new(
        chats: Arc<dyn ChatStore>,
        directory: Arc<dyn UserDirectory>,
        notifier: Arc<dyn NotificationGateway>,
        fanout: Arc<dyn RealtimeFanout>,
        config: Arc<ChatConfig>,
    ) -> Self {
        Self {
            chats,
            directory,
            notifier,
            fanout,
            config,
        }
    }

    /// Idempotent for direct chats: the same pair always resolves to one chat.
    pub async fn create_or_get_chat(
        &self,
        requester_id: Uuid,
        participant_ids: &[Uuid],
        chat_type: ChatType,
    ) -> AppResult<Chat> {
        match chat_type {
            ChatType::Direct => {
                let ids = distinct_with(requester_id, participant_ids);
                let other = match ids.as_slice() {
                    [_, other] => *other,
                    _ => {
                        return Err(AppError::InvalidParticipants(format!(
                            "a direct chat needs exactly 2 distinct participants including the requester, got {}",
                            ids.len()
                        )))
                    }
                };
                self.create_direct(requester_id, other).await
            }
            ChatType::Group => {
                self.create_group(
                    requester_id,
                    NewGroup {
                        name: DEFAULT_GROUP_NAME.to_string(),
                        member_ids: participant_ids.to_vec(),
                        ..Default::default()
                    },
                )
                .await
            }
        }
    }

    async fn create_direct(&self, requester_id: Uuid, other_id: Uuid) -> AppResult<Chat> {
        self.ensure_users_exist(&[requester_id, other_id]).await?;

        if let Some(existing) = self.chats.find_direct_chat(requester_id, other_id).await? {
            debug!(chat_id = %existing.id, "Reusing existing direct chat");
            return self.reactivate_direct(existing).await;
        }

        let now = Utc::now();
        let chat = Chat::new(
            ChatType::Direct,
            vec![
                Participant::new(requester_id, MemberRole::Member, now, 0),
                Participant::new(other_id, MemberRole::Member, now, 0),
            ],
            None,
            now,
        );

        let (chat, created) = self.chats.insert_direct_chat(chat).await?;
        if !created {
            // Lost the creation race to a concurrent request.
            return self.reactivate_direct(chat).await;
        }

        info!(chat_id = %chat.id, "Direct chat created");
        self.announce_new_chat(&chat, requester_id).await;
        Ok(chat)
    }

    /// Bring back participants of a direct chat that left earlier
    async fn reactivate_direct(&self, chat: Chat) -> AppResult<Chat> {
        let departed: Vec<Uuid> = chat
            .participants
            .iter()
            .filter(|p| !p.is_active)
            .map(|p| p.user_id)
            .collect();
        if departed.is_empty() {
            return Ok(chat);
        }

        let mut chat = chat;
        for user_id in departed {
            chat = self
                .chats
                .apply_mutation(
                    chat.id,
                    ChatMutation::AddParticipant {
                        user_id,
                        role: MemberRole::Member,
                        at: Utc::now(),
                    },
                )
                .await?;
            self.publish(
                Channel::Chat(chat.id),
                ChatEvent::MemberJoined {
                    chat_id: chat.id,
                    user_id,
                    role: MemberRole::Member,
                },
            )
            .await;
        }
        Ok(chat)
    }

    pub async fn create_group(&self, requester_id: Uuid, group: NewGroup) -> AppResult<Chat> {
        let ids = distinct_with(requester_id, &group.member_ids);
        if ids.len() < 2 {
            return Err(AppError::InvalidParticipants(
                "a group needs at least 2 distinct participants".into(),
            ));
        }
        if ids.len() > self.config.max_group_size {
            return Err(AppError::InvalidParticipants(format!(
                "a group allows at most {} participants",
                self.config.max_group_size
            )));
        }
        let name = group.name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest("group name must not be empty".into()));
        }
        self.ensure_users_exist(&ids).await?;

        let now = Utc::now();
        let participants = ids
            .iter()
            .map(|&user_id| {
                let role = if user_id == requester_id {
                    MemberRole::Admin
                } else {
                    MemberRole::Member
                };
                Participant::new(user_id, role, now, 0)
            })
            .collect();
        let info = GroupInfo {
            name: name.to_string(),
            description: group.description,
            avatar: group.avatar,
            created_by: requester_id,
            admins: vec![requester_id],
            permissions: group.permissions.unwrap_or_default(),
        };

        let chat = self
            .chats
            .insert_chat(Chat::new(ChatType::Group, participants, Some(info), now))
            .await?;

        info!(chat_id = %chat.id, members = ids.len(), "Group chat created");
        self.announce_new_chat(&chat, requester_id).await;
        Ok(chat)
    }

    /// Deactivates the participant; the chat and its messages are kept.
    pub async fn leave_chat(&self, chat_id: Uuid, user_id: Uuid) -> AppResult<Chat> {
        let before = self.load_chat(chat_id).await?;
        require_active(&before, user_id)?;

        let chat = self
            .chats
            .apply_mutation(
                chat_id,
                ChatMutation::DeactivateParticipant {
                    user_id,
                    at: Utc::now(),
                },
            )
            .await?;

        info!(chat_id = %chat_id, user_id = %user_id, "Participant left chat");
        self.publish(
            Channel::Chat(chat_id),
            ChatEvent::MemberLeft { chat_id, user_id },
        )
        .await;
        self.announce_promotions(&before, &chat).await;
        Ok(chat)
    }

    pub async fn add_members(
        &self,
        chat_id: Uuid,
        requester_id: Uuid,
        user_ids: &[Uuid],
    ) -> AppResult<Chat> {
        let chat = self.load_chat(chat_id).await?;
        let requester = require_active(&chat, requester_id)?;
        let info = require_group(&chat)?;
        if !info.permissions.add_members.allows(requester.role) {
            return Err(AppError::PermissionDenied(
                "only admins can add members to this group".into(),
            ));
        }

        let new_ids: Vec<Uuid> = distinct(user_ids)
            .into_iter()
            .filter(|id| !chat.is_active_participant(*id))
            .collect();
        if new_ids.is_empty() {
            return Ok(chat);
        }
        if chat.active_member_ids().len() + new_ids.len() > self.config.max_group_size {
            return Err(AppError::InvalidParticipants(format!(
                "a group allows at most {} participants",
                self.config.max_group_size
            )));
        }
        self.ensure_users_exist(&new_ids).await?;

        let mut chat = chat;
        for &user_id in &new_ids {
            chat = self
                .chats
                .apply_mutation(
                    chat_id,
                    ChatMutation::AddParticipant {
                        user_id,
                        role: MemberRole::Member,
                        at: Utc::now(),
                    },
                )
                .await?;
            self.publish(
                Channel::Chat(chat_id),
                ChatEvent::MemberJoined {
                    chat_id,
                    user_id,
                    role: MemberRole::Member,
                },
            )
            .await;
            self.publish(
                Channel::User(user_id),
                ChatEvent::ChatCreated {
                    chat_id,
                    chat_type: chat.chat_type,
                    created_by: requester_id,
                    participant_ids: chat.active_member_ids(),
                },
            )
            .await;
        }

        info!(chat_id = %chat_id, added = new_ids.len(), "Members added to group");
        Ok(chat)
    }

    pub async fn remove_member(
        &self,
        chat_id: Uuid,
        requester_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Chat> {
        if requester_id == user_id {
            return self.leave_chat(chat_id, user_id).await;
        }

        let before = self.load_chat(chat_id).await?;
        require_group(&before)?;
        require_admin(&before, requester_id)?;
        if !before.is_active_participant(user_id) {
            return Err(AppError::InvalidParticipants(format!(
                "user {} is not a member of this chat",
                user_id
            )));
        }

        let chat = self
            .chats
            .apply_mutation(
                chat_id,
                ChatMutation::DeactivateParticipant {
                    user_id,
                    at: Utc::now(),
                },
            )
            .await?;

        info!(chat_id = %chat_id, user_id = %user_id, removed_by = %requester_id, "Member removed");
        self.publish(
            Channel::Chat(chat_id),
            ChatEvent::MemberLeft { chat_id, user_id },
        )
        .await;
        self.announce_promotions(&before, &chat).await;
        Ok(chat)
    }

    pub async fn set_role(
        &self,
        chat_id: Uuid,
        requester_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    ) -> AppResult<Chat> {
        let before = self.load_chat(chat_id).await?;
        require_group(&before)?;
        require_admin(&before, requester_id)?;
        let current = before
            .active_participant(user_id)
            .map(|p| p.role)
            .ok_or_else(|| {
                AppError::InvalidParticipants(format!("user {} is not a member of this chat", user_id))
            })?;
        if current == role {
            return Ok(before);
        }

        let chat = self
            .chats
            .apply_mutation(chat_id, ChatMutation::SetRole { user_id, role })
            .await?;
        self.publish(
            Channel::Chat(chat_id),
            ChatEvent::MemberRoleChanged {
                chat_id,
                user_id,
                role,
            },
        )
        .await;
        Ok(chat)
    }

    pub async fn update_group_info(
        &self,
        chat_id: Uuid,
        requester_id: Uuid,
        patch: GroupInfoPatch,
    ) -> AppResult<Chat> {
        let chat = self.load_chat(chat_id).await?;
        let requester = require_active(&chat, requester_id)?;
        let info = require_group(&chat)?;

        if patch.is_empty() {
            return Err(AppError::BadRequest("nothing to update".into()));
        }
        if !info.permissions.edit_info.allows(requester.role) {
            return Err(AppError::PermissionDenied(
                "only admins can edit this group".into(),
            ));
        }
        if patch.permissions.is_some() && !requester.role.is_privileged() {
            return Err(AppError::PermissionDenied(
                "only admins can change group permissions".into(),
            ));
        }
        if matches!(patch.name.as_deref(), Some(name) if name.trim().is_empty()) {
            return Err(AppError::BadRequest("group name must not be empty".into()));
        }

        let mut updated_fields = Vec::new();
        if patch.name.is_some() {
            updated_fields.push("name".to_string());
        }
        if patch.description.is_some() {
            updated_fields.push("description".to_string());
        }
        if patch.avatar.is_some() {
            updated_fields.push("avatar".to_string());
        }
        if patch.permissions.is_some() {
            updated_fields.push("permissions".to_string());
        }

        let chat = self
            .chats
            .apply_mutation(chat_id, ChatMutation::UpdateGroupInfo(patch))
            .await?;
        self.publish(
            Channel::Chat(chat_id),
            ChatEvent::ChatUpdated {
                chat_id,
                updated_fields,
            },
        )
        .await;
        Ok(chat)
    }

    pub async fn update_settings(
        &self,
        chat_id: Uuid,
        requester_id: Uuid,
        settings: ChatSettings,
    ) -> AppResult<Chat> {
        let chat = self.load_chat(chat_id).await?;
        let requester = require_active(&chat, requester_id)?;
        if let Some(info) = chat.group_info.as_ref() {
            if !info.permissions.edit_info.allows(requester.role) {
                return Err(AppError::PermissionDenied(
                    "only admins can change chat settings".into(),
                ));
            }
        }
        if settings.disappearing_messages.enabled
            && settings.disappearing_messages.duration_secs.unwrap_or(0) == 0
        {
            return Err(AppError::BadRequest(
                "disappearing messages need a positive duration".into(),
            ));
        }

        let chat = self
            .chats
            .apply_mutation(chat_id, ChatMutation::UpdateSettings(settings))
            .await?;
        self.publish(
            Channel::Chat(chat_id),
            ChatEvent::ChatUpdated {
                chat_id,
                updated_fields: vec!["settings".to_string()],
            },
        )
        .await;
        Ok(chat)
    }

    /// Mute notifications; `until = None` mutes indefinitely
    pub async fn mute_chat(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> AppResult<Chat> {
        self.update_preference(
            chat_id,
            user_id,
            "is_muted",
            ChatMutation::SetMute {
                user_id,
                muted: true,
                until,
            },
        )
        .await
    }

    pub async fn unmute_chat(&self, chat_id: Uuid, user_id: Uuid) -> AppResult<Chat> {
        self.update_preference(
            chat_id,
            user_id,
            "is_muted",
            ChatMutation::SetMute {
                user_id,
                muted: false,
                until: None,
            },
        )
        .await
    }

    pub async fn pin_chat(&self, chat_id: Uuid, user_id: Uuid) -> AppResult<Chat> {
        self.update_preference(
            chat_id,
            user_id,
            "is_pinned",
            ChatMutation::SetPin {
                user_id,
                pinned: true,
                at: Utc::now(),
            },
        )
        .await
    }

    pub async fn unpin_chat(&self, chat_id: Uuid, user_id: Uuid) -> AppResult<Chat> {
        self.update_preference(
            chat_id,
            user_id,
            "is_pinned",
            ChatMutation::SetPin {
                user_id,
                pinned: false,
                at: Utc::now(),
            },
        )
        .await
    }

    pub async fn archive_chat(&self, chat_id: Uuid, user_id: Uuid) -> AppResult<Chat> {
        self.update_preference(
            chat_id,
            user_id,
            "is_archived",
            ChatMutation::SetArchived {
                user_id,
                archived: true,
                at: Utc::now(),
            },
        )
        .await
    }

    pub async fn unarchive_chat(&self, chat_id: Uuid, user_id: Uuid) -> AppResult<Chat> {
        self.update_preference(
            chat_id,
            user_id,
            "is_archived",
            ChatMutation::SetArchived {
                user_id,
                archived: false,
                at: Utc::now(),
            },
        )
        .await
    }

    pub async fn set_custom_name(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        name: Option<String>,
    ) -> AppResult<Chat> {
        self.update_preference(
            chat_id,
            user_id,
            "custom_name",
            ChatMutation::SetCustomName { user_id, name },
        )
        .await
    }

    pub async fn get_chat(&self, chat_id: Uuid, requester_id: Uuid) -> AppResult<Chat> {
        let chat = self.load_chat(chat_id).await?;
        require_active(&chat, requester_id)?;
        Ok(chat)
    }

    /// Chats where the user is active, most recent activity first
    pub async fn get_user_chats(&self, user_id: Uuid) -> AppResult<Vec<ChatSummary>> {
        let now = Utc::now();
        let mut chats: Vec<(DateTime<Utc>, ChatSummary)> = self
            .chats
            .chats_for_user(user_id)
            .await?
            .iter()
            .filter_map(|chat| {
                chat.active_participant(user_id)
                    .map(|viewer| (chat.activity_at(), ChatSummary::for_viewer(chat, viewer, now)))
            })
            .collect();

        chats.sort_by(|(a_at, a), (b_at, b)| b_at.cmp(a_at).then_with(|| b.chat_id.cmp(&a.chat_id)));
        Ok(chats.into_iter().map(|(_, summary)| summary).collect())
    }

    async fn update_preference(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        field: &str,
        mutation: ChatMutation,
    ) -> AppResult<Chat> {
        let chat = self.chats.apply_mutation(chat_id, mutation).await?;
        debug!(chat_id = %chat_id, user_id = %user_id, field, "Chat preference updated");
        self.publish(
            Channel::User(user_id),
            ChatEvent::ChatUpdated {
                chat_id,
                updated_fields: vec![field.to_string()],
            },
        )
        .await;
        Ok(chat)
    }

    async fn load_chat(&self, chat_id: Uuid) -> AppResult<Chat> {
        self.chats
            .get_chat(chat_id)
            .await?
            .filter(|chat| !chat.is_deleted)
            .ok_or(AppError::ChatNotFound)
    }

    async fn ensure_users_exist(&self, user_ids: &[Uuid]) -> AppResult<()> {
        let missing = self.directory.missing_users(user_ids).await?;
        if missing.is_empty() {
            Ok(())
        } else {
            let ids: Vec<String> = missing.iter().map(Uuid::to_string).collect();
            Err(AppError::InvalidParticipants(format!(
                "unknown users: {}",
                ids.join(", ")
            )))
        }
    }

    async fn announce_new_chat(&self, chat: &Chat, creator_id: Uuid) {
        let participant_ids = chat.active_member_ids();
        for &user_id in &participant_ids {
            self.publish(
                Channel::User(user_id),
                ChatEvent::ChatCreated {
                    chat_id: chat.id,
                    chat_type: chat.chat_type,
                    created_by: creator_id,
                    participant_ids: participant_ids.clone(),
                },
            )
            .await;
        }

        let sender_name = self.sender_name(creator_id).await;
        let preview = match chat.group_info.as_ref() {
            Some(info) => format!("{} added you to {}", sender_name, info.name),
            None => format!("{} started a conversation", sender_name),
        };
        let now = Utc::now();
        let requests = participant_ids
            .iter()
            .filter(|&&id| id != creator_id)
            .map(|&recipient_id| NotificationRequest {
                id: Uuid::new_v4(),
                kind: NotificationKind::NewChat,
                chat_id: chat.id,
                recipient_id,
                sender_id: creator_id,
                sender_name: sender_name.clone(),
                message_id: None,
                preview: preview.clone(),
                timestamp: now,
            })
            .collect();
        notification::dispatch(self.notifier.clone(), requests);
    }

    async fn announce_promotions(&self, before: &Chat, after: &Chat) {
        for participant in &after.participants {
            let was_admin = before
                .participant(participant.user_id)
                .map(|p| p.role.is_privileged())
                .unwrap_or(false);
            if participant.is_active && participant.role.is_privileged() && !was_admin {
                self.publish(
                    Channel::Chat(after.id),
                    ChatEvent::MemberRoleChanged {
                        chat_id: after.id,
                        user_id: participant.user_id,
                        role: participant.role,
                    },
                )
                .await;
            }
        }
    }

    async fn sender_name(&self, user_id: Uuid) -> String {
        self.directory
            .display_name(user_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "Someone".to_string())
    }

    async fn publish(&self, channel: Channel, event: ChatEvent) {
        publish_best_effort(self.fanout.as_ref(), channel, event).await;
    }
}

pub(crate) fn require_active(chat: &Chat, user_id: Uuid) -> AppResult<&Participant> {
    chat.active_participant(user_id)
        .ok_or(AppError::NotAParticipant)
}

fn require_group(chat: &Chat) -> AppResult<&GroupInfo> {
    chat.group_info
        .as_ref()
        .filter(|_| chat.chat_type == ChatType::Group)
        .ok_or_else(|| AppError::BadRequest("operation is only available in group chats".into()))
}

fn require_admin(chat: &Chat, user_id: Uuid) -> AppResult<()> {
    let participant = require_active(chat, user_id)?;
    if participant.role.is_privileged() {
        Ok(())
    } else {
        Err(AppError::PermissionDenied("only admins can manage members".into()))
    }
}

fn distinct(ids: &[Uuid]) -> Vec<Uuid> {
    let mut out: Vec<Uuid> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}

/// Distinct ids with `requester` first
fn distinct_with(requester: Uuid, ids: &[Uuid]) -> Vec<Uuid> {
    let mut all = Vec::with_capacity(ids.len() + 1);
    all.push(requester);
    all.extend_from_slice(ids);
    distinct(&all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_with_puts_requester_first() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert_eq!(distinct_with(me, &[other, me, other]), vec![me, other]);
        assert_eq!(distinct_with(me, &[me]), vec![me]);
    }
}
