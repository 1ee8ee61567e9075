//! In-memory store backed by `DashMap`.
//!
//! Locking is per entry. Lock order is always `direct_pairs` -> `chats` ->
//! `user_chats` / `logs`; no path acquires a chat entry while holding a log
//! entry, and no path holds two entries of the same map.

use super::{
    direct_pair_key, direct_pair_of, ChatMutation, ChatStore, MessageMutation, MessageStore,
    ReadCursor, UnreadReset, UnreadStore,
};
use crate::error::{AppError, AppResult};
use crate::models::{Chat, LastMessage, Message, MessageCursor, PageAnchor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use tracing::debug;
use uuid::Uuid;

/// Append-only message log of one chat
#[derive(Debug, Default)]
struct ChatLog {
    last_seq: u64,
    by_seq: BTreeMap<u64, Message>,
    by_id: HashMap<Uuid, u64>,
    /// `(created_at, id)` -> seq, the pagination order
    ordered: BTreeMap<(DateTime<Utc>, Uuid), u64>,
}

impl ChatLog {
    fn message(&self, message_id: Uuid) -> Option<&Message> {
        self.by_id
            .get(&message_id)
            .and_then(|seq| self.by_seq.get(seq))
    }

    fn message_mut(&mut self, message_id: Uuid) -> Option<&mut Message> {
        let seq = *self.by_id.get(&message_id)?;
        self.by_seq.get_mut(&seq)
    }

    /// Messages committed after `after_seq`, authored by others and not hidden for `user_id`
    fn count_unread(&self, user_id: Uuid, after_seq: u64) -> u64 {
        self.by_seq
            .range((Bound::Excluded(after_seq), Bound::Unbounded))
            .filter(|(_, m)| m.sender_id != user_id && m.is_visible_to(user_id))
            .count() as u64
    }

    fn collect_page<'a, I>(&self, keys: I, viewer: Uuid, limit: usize) -> (Vec<Message>, bool)
    where
        I: Iterator<Item = &'a u64>,
    {
        let mut page: Vec<Message> = keys
            .filter_map(|seq| self.by_seq.get(seq))
            .filter(|m| m.is_visible_to(viewer))
            .take(limit + 1)
            .cloned()
            .collect();
        let has_more = page.len() > limit;
        page.truncate(limit);
        (page, has_more)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    chats: DashMap<Uuid, Chat>,
    direct_pairs: DashMap<(Uuid, Uuid), Uuid>,
    user_chats: DashMap<Uuid, BTreeSet<Uuid>>,
    logs: DashMap<Uuid, ChatLog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn head_seq(&self, chat_id: Uuid) -> u64 {
        self.logs.get(&chat_id).map(|log| log.last_seq).unwrap_or(0)
    }

    fn index_participants(&self, chat: &Chat) {
        for participant in &chat.participants {
            self.user_chats
                .entry(participant.user_id)
                .or_default()
                .insert(chat.id);
        }
    }

    fn store_new_chat(&self, chat: Chat) -> Chat {
        self.logs.entry(chat.id).or_default();
        self.index_participants(&chat);
        self.chats.insert(chat.id, chat.clone());
        chat
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn insert_chat(&self, chat: Chat) -> AppResult<Chat> {
        if self.chats.contains_key(&chat.id) {
            return Err(AppError::Storage(format!("chat {} already exists", chat.id)));
        }
        Ok(self.store_new_chat(chat))
    }

    async fn insert_direct_chat(&self, chat: Chat) -> AppResult<(Chat, bool)> {
        let key = direct_pair_of(&chat)?;

        match self.direct_pairs.entry(key) {
            Entry::Occupied(mut occupied) => {
                let existing_id = *occupied.get();
                if let Some(existing) = self.chats.get(&existing_id) {
                    if !existing.is_deleted {
                        debug!(chat_id = %existing_id, "Direct chat already exists for pair");
                        return Ok((existing.value().clone(), false));
                    }
                }
                let stored = self.store_new_chat(chat);
                occupied.insert(stored.id);
                Ok((stored, true))
            }
            Entry::Vacant(vacant) => {
                let stored = self.store_new_chat(chat);
                vacant.insert(stored.id);
                Ok((stored, true))
            }
        }
    }

    async fn find_direct_chat(&self, user_a: Uuid, user_b: Uuid) -> AppResult<Option<Chat>> {
        let chat_id = match self.direct_pairs.get(&direct_pair_key(user_a, user_b)) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self
            .chats
            .get(&chat_id)
            .filter(|chat| !chat.is_deleted)
            .map(|chat| chat.value().clone()))
    }

    async fn get_chat(&self, chat_id: Uuid) -> AppResult<Option<Chat>> {
        Ok(self.chats.get(&chat_id).map(|chat| chat.value().clone()))
    }

    async fn chats_for_user(&self, user_id: Uuid) -> AppResult<Vec<Chat>> {
        let chat_ids: Vec<Uuid> = self
            .user_chats
            .get(&user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        Ok(chat_ids
            .into_iter()
            .filter_map(|id| self.chats.get(&id).map(|chat| chat.value().clone()))
            .filter(|chat| !chat.is_deleted)
            .collect())
    }

    async fn apply_mutation(&self, chat_id: Uuid, mutation: ChatMutation) -> AppResult<Chat> {
        let mut chat = self.chats.get_mut(&chat_id).ok_or(AppError::ChatNotFound)?;
        let head_seq = self.head_seq(chat_id);

        // Mutate a copy so a failed mutation leaves the entry untouched.
        let mut updated = chat.value().clone();
        mutation.apply(&mut updated, head_seq, Utc::now())?;
        self.index_participants(&updated);
        *chat = updated;
        Ok(chat.value().clone())
    }

    async fn update_last_message_if_newer(
        &self,
        chat_id: Uuid,
        candidate: LastMessage,
    ) -> AppResult<bool> {
        let mut chat = self.chats.get_mut(&chat_id).ok_or(AppError::ChatNotFound)?;
        let newer = match chat.last_message.as_ref() {
            None => true,
            Some(current) => candidate.recency_cmp(current) != Ordering::Less,
        };
        if newer {
            chat.last_message = Some(candidate);
            chat.updated_at = Utc::now();
        }
        Ok(newer)
    }

    async fn refresh_last_message_preview(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        preview: String,
    ) -> AppResult<bool> {
        let mut chat = self.chats.get_mut(&chat_id).ok_or(AppError::ChatNotFound)?;
        match chat.last_message.as_mut() {
            Some(last) if last.message_id == message_id => {
                last.preview = preview;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append_message(&self, mut message: Message) -> AppResult<Message> {
        let mut log = self.logs.entry(message.chat_id).or_default();
        if log.by_id.contains_key(&message.id) {
            return Err(AppError::Storage(format!(
                "message {} already exists",
                message.id
            )));
        }

        log.last_seq += 1;
        message.seq = log.last_seq;
        log.by_id.insert(message.id, message.seq);
        log.ordered
            .insert((message.created_at, message.id), message.seq);
        log.by_seq.insert(message.seq, message.clone());
        Ok(message)
    }

    async fn get_message(&self, chat_id: Uuid, message_id: Uuid) -> AppResult<Option<Message>> {
        Ok(self
            .logs
            .get(&chat_id)
            .and_then(|log| log.message(message_id).cloned()))
    }

    async fn apply_message_mutation(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        mutation: MessageMutation,
    ) -> AppResult<(Message, bool)> {
        let mut log = self.logs.get_mut(&chat_id).ok_or(AppError::MessageNotFound)?;
        let message = log
            .message_mut(message_id)
            .ok_or(AppError::MessageNotFound)?;
        let changed = mutation.apply(message);
        Ok((message.clone(), changed))
    }

    async fn page(
        &self,
        chat_id: Uuid,
        viewer: Uuid,
        anchor: PageAnchor,
        limit: usize,
    ) -> AppResult<(Vec<Message>, bool)> {
        let log = match self.logs.get(&chat_id) {
            Some(log) => log,
            None => return Ok((Vec::new(), false)),
        };
        let key = |c: MessageCursor| (c.created_at, c.id);

        let (mut messages, has_more, newest_first) = match anchor {
            PageAnchor::Latest => {
                let (page, more) = log.collect_page(log.ordered.values().rev(), viewer, limit);
                (page, more, true)
            }
            PageAnchor::Before(cursor) => {
                let range = log
                    .ordered
                    .range((Bound::Unbounded, Bound::Excluded(key(cursor))));
                let (page, more) = log.collect_page(range.map(|(_, seq)| seq).rev(), viewer, limit);
                (page, more, true)
            }
            PageAnchor::After(cursor) => {
                let range = log
                    .ordered
                    .range((Bound::Excluded(key(cursor)), Bound::Unbounded));
                let (page, more) = log.collect_page(range.map(|(_, seq)| seq), viewer, limit);
                (page, more, false)
            }
        };

        if newest_first {
            messages.reverse();
        }
        Ok((messages, has_more))
    }

    async fn last_seq(&self, chat_id: Uuid) -> AppResult<u64> {
        Ok(self.head_seq(chat_id))
    }
}

#[async_trait]
impl UnreadStore for MemoryStore {
    async fn increment_unread(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        seq: u64,
    ) -> AppResult<Option<u64>> {
        let mut chat = self.chats.get_mut(&chat_id).ok_or(AppError::ChatNotFound)?;
        let participant = match chat.participant_mut(user_id) {
            Some(p) if p.is_active => p,
            _ => return Ok(None),
        };
        if seq <= participant.read_seq.max(participant.unread_watermark) {
            return Ok(None);
        }
        participant.unread_count += 1;
        Ok(Some(participant.unread_count))
    }

    async fn reset_unread(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        cursor: Option<ReadCursor>,
    ) -> AppResult<UnreadReset> {
        let mut chat = self.chats.get_mut(&chat_id).ok_or(AppError::ChatNotFound)?;
        let participant = chat
            .participant_mut(user_id)
            .filter(|p| p.is_active)
            .ok_or(AppError::NotAParticipant)?;

        let mut cursor_moved = false;
        if let Some(cursor) = cursor {
            if cursor.seq > participant.read_seq {
                participant.read_seq = cursor.seq;
                participant.last_seen_message_id = Some(cursor.message_id);
                participant.last_seen_at = Some(cursor.at);
                cursor_moved = true;
            }
        }

        let (unread_count, head) = match self.logs.get(&chat_id) {
            Some(log) => (log.count_unread(user_id, participant.read_seq), log.last_seq),
            None => (0, 0),
        };

        let previous_count = participant.unread_count;
        participant.unread_count = unread_count;
        participant.unread_watermark = participant.unread_watermark.max(head);

        Ok(UnreadReset {
            previous_count,
            unread_count,
            cursor_moved,
        })
    }
}
