//! Persistence seams for chats, messages and unread counters.
//!
//! Every mutation is expressed as a field-level operation on a single chat or
//! message entry so implementations can apply it atomically without
//! rewriting whole documents.

pub mod memory;
pub mod postgres;

use crate::error::{AppError, AppResult};
use crate::models::{
    ArchiveEntry, Chat, ChatSettings, ChatType, GroupInfoPatch, LastMessage, MemberRole, Message,
    MessageContent, MessageStatus, PageAnchor, Participant, Reaction,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Unordered pair key for direct chats
pub fn direct_pair_key(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Pair key of a direct chat, rejecting anything but exactly two participants
pub(crate) fn direct_pair_of(chat: &Chat) -> AppResult<(Uuid, Uuid)> {
    match chat.participants.as_slice() {
        [a, b] if chat.chat_type == ChatType::Direct => Ok(direct_pair_key(a.user_id, b.user_id)),
        _ => Err(AppError::InvalidParticipants(
            "a direct chat needs exactly two participants".into(),
        )),
    }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Insert a new (group) chat
    async fn insert_chat(&self, chat: Chat) -> AppResult<Chat>;

    /// Conditional insert keyed by the unordered participant pair.
    /// Returns the stored chat and whether this call created it; when another
    /// non-deleted direct chat already exists for the pair, that chat is returned.
    async fn insert_direct_chat(&self, chat: Chat) -> AppResult<(Chat, bool)>;

    async fn find_direct_chat(&self, user_a: Uuid, user_b: Uuid) -> AppResult<Option<Chat>>;

    async fn get_chat(&self, chat_id: Uuid) -> AppResult<Option<Chat>>;

    /// Every chat the user has a participant entry in, active or not
    async fn chats_for_user(&self, user_id: Uuid) -> AppResult<Vec<Chat>>;

    async fn apply_mutation(&self, chat_id: Uuid, mutation: ChatMutation) -> AppResult<Chat>;

    /// Replace the cached last message only if `candidate` is at least as recent
    /// as the cached one. Returns whether the cache changed.
    async fn update_last_message_if_newer(
        &self,
        chat_id: Uuid,
        candidate: LastMessage,
    ) -> AppResult<bool>;

    /// Replace the cached preview if `message_id` is still the cached last message
    async fn refresh_last_message_preview(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        preview: String,
    ) -> AppResult<bool>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append to the chat log, assigning the next commit sequence
    async fn append_message(&self, message: Message) -> AppResult<Message>;

    async fn get_message(&self, chat_id: Uuid, message_id: Uuid) -> AppResult<Option<Message>>;

    /// Apply a mutation to one message. Returns the message after the
    /// mutation and whether anything changed.
    async fn apply_message_mutation(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        mutation: MessageMutation,
    ) -> AppResult<(Message, bool)>;

    /// Messages in `(created_at, id)` order, excluding those hidden for `viewer`.
    /// Returns at most `limit` messages (oldest first) and whether more exist
    /// beyond them in the paging direction.
    async fn page(
        &self,
        chat_id: Uuid,
        viewer: Uuid,
        anchor: PageAnchor,
        limit: usize,
    ) -> AppResult<(Vec<Message>, bool)>;

    /// Highest commit sequence in the chat (0 when empty)
    async fn last_seq(&self, chat_id: Uuid) -> AppResult<u64>;
}

/// Read cursor position to move a participant to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCursor {
    pub message_id: Uuid,
    pub seq: u64,
    pub at: DateTime<Utc>,
}

/// Outcome of a cursor move plus unread recompute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadReset {
    pub previous_count: u64,
    pub unread_count: u64,
    pub cursor_moved: bool,
}

impl UnreadReset {
    pub fn changed(&self) -> bool {
        self.cursor_moved || self.previous_count != self.unread_count
    }
}

#[async_trait]
pub trait UnreadStore: Send + Sync {
    /// Atomically increment the participant's unread count for the message
    /// committed at `seq`. Applies only when the participant is active and
    /// `seq` is beyond both its read cursor and the last recompute watermark.
    /// Returns the new count when applied.
    async fn increment_unread(&self, chat_id: Uuid, user_id: Uuid, seq: u64)
        -> AppResult<Option<u64>>;

    /// Move the read cursor forward (never backwards) and recompute the unread
    /// count from the log, as one atomic step. With `cursor = None` only the
    /// recompute happens.
    async fn reset_unread(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        cursor: Option<ReadCursor>,
    ) -> AppResult<UnreadReset>;
}

/// Field-level change to a chat entry
#[derive(Debug, Clone)]
pub enum ChatMutation {
    /// Add a participant, or give a departed one a fresh active entry.
    /// No-op for an already active participant.
    AddParticipant {
        user_id: Uuid,
        role: MemberRole,
        at: DateTime<Utc>,
    },
    /// Mark inactive. In a group left without an active admin, the
    /// longest-standing active member is promoted.
    DeactivateParticipant { user_id: Uuid, at: DateTime<Utc> },
    SetRole { user_id: Uuid, role: MemberRole },
    SetMute {
        user_id: Uuid,
        muted: bool,
        until: Option<DateTime<Utc>>,
    },
    SetPin {
        user_id: Uuid,
        pinned: bool,
        at: DateTime<Utc>,
    },
    SetCustomName { user_id: Uuid, name: Option<String> },
    SetArchived {
        user_id: Uuid,
        archived: bool,
        at: DateTime<Utc>,
    },
    UpdateGroupInfo(GroupInfoPatch),
    UpdateSettings(ChatSettings),
}

impl ChatMutation {
    /// Apply to a chat. `head_seq` is the chat log's current commit sequence,
    /// used as the read cursor of participants (re)joining.
    pub fn apply(self, chat: &mut Chat, head_seq: u64, now: DateTime<Utc>) -> AppResult<()> {
        match self {
            ChatMutation::AddParticipant { user_id, role, at } => {
                match chat.participant_mut(user_id) {
                    Some(existing) if existing.is_active => return Ok(()),
                    Some(existing) => {
                        *existing = Participant::new(user_id, role, at, head_seq);
                    }
                    None => chat
                        .participants
                        .push(Participant::new(user_id, role, at, head_seq)),
                }
                chat.sync_admins();
                chat.updated_at = now;
            }
            ChatMutation::DeactivateParticipant { user_id, at } => {
                let participant = active_mut(chat, user_id)?;
                participant.is_active = false;
                participant.left_at = Some(at);
                participant.unread_count = 0;

                if chat.chat_type == ChatType::Group {
                    promote_successor_if_needed(chat);
                }
                chat.sync_admins();
                chat.updated_at = now;
            }
            ChatMutation::SetRole { user_id, role } => {
                let demoting_last_admin = role == MemberRole::Member
                    && chat
                        .participants
                        .iter()
                        .filter(|p| p.is_active && p.role.is_privileged())
                        .all(|p| p.user_id == user_id);
                let participant = active_mut(chat, user_id)?;
                if participant.role == role {
                    return Ok(());
                }
                if demoting_last_admin {
                    return Err(AppError::BadRequest(
                        "a group must keep at least one admin".into(),
                    ));
                }
                participant.role = role;
                chat.sync_admins();
                chat.updated_at = now;
            }
            ChatMutation::SetMute {
                user_id,
                muted,
                until,
            } => {
                let participant = active_mut(chat, user_id)?;
                participant.is_muted = muted;
                participant.muted_until = if muted { until } else { None };
            }
            ChatMutation::SetPin {
                user_id,
                pinned,
                at,
            } => {
                let participant = active_mut(chat, user_id)?;
                participant.is_pinned = pinned;
                participant.pinned_at = pinned.then_some(at);
            }
            ChatMutation::SetCustomName { user_id, name } => {
                let participant = active_mut(chat, user_id)?;
                participant.custom_name = name.filter(|n| !n.trim().is_empty());
            }
            ChatMutation::SetArchived {
                user_id,
                archived,
                at,
            } => {
                active_mut(chat, user_id)?;
                chat.archived_by.retain(|a| a.user_id != user_id);
                if archived {
                    chat.archived_by.push(ArchiveEntry {
                        user_id,
                        archived_at: at,
                    });
                }
                chat.is_archived = !chat.archived_by.is_empty();
            }
            ChatMutation::UpdateGroupInfo(patch) => {
                let info = chat.group_info.as_mut().ok_or_else(|| {
                    AppError::BadRequest("direct chats have no group info".into())
                })?;
                if let Some(name) = patch.name {
                    info.name = name;
                }
                if let Some(description) = patch.description {
                    info.description = Some(description);
                }
                if let Some(avatar) = patch.avatar {
                    info.avatar = Some(avatar);
                }
                if let Some(permissions) = patch.permissions {
                    info.permissions = permissions;
                }
                chat.updated_at = now;
            }
            ChatMutation::UpdateSettings(settings) => {
                chat.settings = settings;
                chat.updated_at = now;
            }
        }
        Ok(())
    }
}

fn active_mut(chat: &mut Chat, user_id: Uuid) -> AppResult<&mut Participant> {
    chat.participant_mut(user_id)
        .filter(|p| p.is_active)
        .ok_or(AppError::NotAParticipant)
}

fn promote_successor_if_needed(chat: &mut Chat) {
    let has_admin = chat
        .participants
        .iter()
        .any(|p| p.is_active && p.role.is_privileged());
    if has_admin {
        return;
    }

    // Longest-standing active member; ties keep list order.
    let successor = chat
        .participants
        .iter_mut()
        .filter(|p| p.is_active)
        .min_by_key(|p| p.joined_at);
    if let Some(successor) = successor {
        successor.role = MemberRole::Admin;
        info!(
            chat_id = %chat.id,
            user_id = %successor.user_id,
            "Promoted member to admin after last admin left"
        );
    }
}

/// Field-level change to a single message
#[derive(Debug, Clone)]
pub enum MessageMutation {
    /// Forward-only status compare-and-set
    AdvanceStatus {
        next: MessageStatus,
        at: DateTime<Utc>,
    },
    Edit {
        content: MessageContent,
        at: DateTime<Utc>,
    },
    /// Global tombstone
    Tombstone { at: DateTime<Utc> },
    HideFor { user_id: Uuid },
    AddReaction(Reaction),
    RemoveReaction { user_id: Uuid, emoji: String },
}

impl MessageMutation {
    /// Returns whether the message changed
    pub fn apply(self, message: &mut Message) -> bool {
        match self {
            MessageMutation::AdvanceStatus { next, at } => message.advance_status(next, at),
            MessageMutation::Edit { content, at } => {
                if message.is_deleted {
                    return false;
                }
                message.content = content;
                message.is_edited = true;
                message.edited_at = Some(at);
                message.updated_at = at;
                true
            }
            MessageMutation::Tombstone { at } => {
                if message.is_deleted {
                    return false;
                }
                message.is_deleted = true;
                message.deleted_at = Some(at);
                message.updated_at = at;
                true
            }
            MessageMutation::HideFor { user_id } => message.deleted_for.insert(user_id),
            MessageMutation::AddReaction(reaction) => {
                let duplicate = message
                    .reactions
                    .iter()
                    .any(|r| r.user_id == reaction.user_id && r.emoji == reaction.emoji);
                if duplicate || message.is_deleted {
                    return false;
                }
                message.reactions.push(reaction);
                true
            }
            MessageMutation::RemoveReaction { user_id, emoji } => {
                let before = message.reactions.len();
                message
                    .reactions
                    .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
                message.reactions.len() != before
            }
        }
    }
}
