//! PostgreSQL store on a deadpool connection pool.
//!
//! Row lock order is `direct_chat_pairs` -> `chats` -> `chat_participants`
//! -> `messages`. Appends bump `chats.last_seq` in the same statement that
//! inserts the message, so the commit sequence is dense per chat.

use super::{
    direct_pair_of, ChatMutation, ChatStore, MessageMutation, MessageStore, ReadCursor,
    UnreadReset, UnreadStore,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    ArchiveEntry, Chat, ChatSettings, ChatType, GroupInfo, LastMessage, MemberRole, Message,
    MessageContent, MessageStatus, MessageType, PageAnchor, Participant, Reaction,
};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use deadpool_postgres::{Manager, Pool};
use std::collections::HashMap;
use tokio_postgres::types::Json;
use tokio_postgres::{GenericClient, NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

const MIGRATION: &str = include_str!("../../migrations/0001_chat_core.sql");

const CHAT_COLUMNS: &str = "id, chat_type, group_info, settings, last_seq, last_message_id, \
     last_message_preview, last_message_sender_id, last_message_type, last_message_at, \
     is_deleted, created_at, updated_at";

const PARTICIPANT_COLUMNS: &str = "chat_id, user_id, role, is_active, joined_at, left_at, \
     last_seen_message_id, last_seen_at, unread_count, is_muted, muted_until, is_pinned, \
     pinned_at, custom_name, archived_at, read_seq, unread_watermark";

const MESSAGE_COLUMNS: &str = "id, chat_id, seq, sender_id, message_type, content, status, \
     delivered_at, read_at, edited_at, is_edited, reply_to, forwarded_from, reactions, \
     is_deleted, deleted_at, deleted_for, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool for `database_url`. Connections are opened lazily.
    pub fn connect(database_url: &str, max_connections: usize) -> AppResult<Self> {
        let config = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| AppError::Config(format!("invalid DATABASE_URL: {e}")))?;
        let manager = Manager::new(config, NoTls);
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .build()
            .map_err(|e| AppError::Config(format!("failed to create database pool: {e}")))?;
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> AppResult<()> {
        let client = self.pool.get().await?;
        client.batch_execute(MIGRATION).await?;
        info!("Chat store migrations applied");
        Ok(())
    }
}

fn to_db_seq(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_seq(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn chat_type_to_db(chat_type: ChatType) -> &'static str {
    match chat_type {
        ChatType::Direct => "direct",
        ChatType::Group => "group",
    }
}

fn chat_type_from_db(value: &str) -> AppResult<ChatType> {
    match value {
        "direct" => Ok(ChatType::Direct),
        "group" => Ok(ChatType::Group),
        other => Err(AppError::Storage(format!("unknown chat type `{other}`"))),
    }
}

fn participant_from_row(row: &Row) -> AppResult<(Participant, Option<DateTime<Utc>>)> {
    let role: String = row.try_get("role")?;
    let role = MemberRole::from_db(&role)
        .ok_or_else(|| AppError::Storage(format!("unknown member role `{role}`")))?;
    let participant = Participant {
        user_id: row.try_get("user_id")?,
        role,
        is_active: row.try_get("is_active")?,
        joined_at: row.try_get("joined_at")?,
        left_at: row.try_get("left_at")?,
        last_seen_message_id: row.try_get("last_seen_message_id")?,
        last_seen_at: row.try_get("last_seen_at")?,
        unread_count: from_db_seq(row.try_get("unread_count")?),
        is_muted: row.try_get("is_muted")?,
        muted_until: row.try_get("muted_until")?,
        is_pinned: row.try_get("is_pinned")?,
        pinned_at: row.try_get("pinned_at")?,
        custom_name: row.try_get("custom_name")?,
        read_seq: from_db_seq(row.try_get("read_seq")?),
        unread_watermark: from_db_seq(row.try_get("unread_watermark")?),
    };
    Ok((participant, row.try_get("archived_at")?))
}

fn last_message_from_row(row: &Row) -> AppResult<Option<LastMessage>> {
    let id: Option<Uuid> = row.try_get("last_message_id")?;
    let preview: Option<String> = row.try_get("last_message_preview")?;
    let sender_id: Option<Uuid> = row.try_get("last_message_sender_id")?;
    let message_type: Option<String> = row.try_get("last_message_type")?;
    let timestamp: Option<DateTime<Utc>> = row.try_get("last_message_at")?;

    match (id, preview, sender_id, message_type, timestamp) {
        (Some(message_id), Some(preview), Some(sender_id), Some(message_type), Some(timestamp)) => {
            let message_type = MessageType::from_db(&message_type).ok_or_else(|| {
                AppError::Storage(format!("unknown message type `{message_type}`"))
            })?;
            Ok(Some(LastMessage {
                message_id,
                preview,
                sender_id,
                message_type,
                timestamp,
            }))
        }
        _ => Ok(None),
    }
}

/// Assemble a chat from its row and its participant rows (in position order).
/// Returns the chat and the head of its commit sequence.
fn chat_from_rows(row: &Row, participant_rows: &[Row]) -> AppResult<(Chat, u64)> {
    let chat_type: String = row.try_get("chat_type")?;
    let group_info: Option<Json<GroupInfo>> = row.try_get("group_info")?;
    let Json(settings): Json<ChatSettings> = row.try_get("settings")?;

    let mut participants = Vec::with_capacity(participant_rows.len());
    let mut archived_by = Vec::new();
    for participant_row in participant_rows {
        let (participant, archived_at) = participant_from_row(participant_row)?;
        if let Some(archived_at) = archived_at {
            archived_by.push(ArchiveEntry {
                user_id: participant.user_id,
                archived_at,
            });
        }
        participants.push(participant);
    }
    archived_by.sort_by_key(|entry| entry.archived_at);

    let chat = Chat {
        id: row.try_get("id")?,
        chat_type: chat_type_from_db(&chat_type)?,
        participants,
        group_info: group_info.map(|Json(info)| info),
        last_message: last_message_from_row(row)?,
        settings,
        is_archived: !archived_by.is_empty(),
        archived_by,
        is_deleted: row.try_get("is_deleted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    };
    Ok((chat, from_db_seq(row.try_get("last_seq")?)))
}

fn message_from_row(row: &Row) -> AppResult<Message> {
    let message_type: String = row.try_get("message_type")?;
    let message_type = MessageType::from_db(&message_type)
        .ok_or_else(|| AppError::Storage(format!("unknown message type `{message_type}`")))?;
    let status: i16 = row.try_get("status")?;
    let status = MessageStatus::from_db(status)
        .ok_or_else(|| AppError::Storage(format!("unknown message status {status}")))?;
    let Json(content): Json<MessageContent> = row.try_get("content")?;
    let Json(reactions): Json<Vec<Reaction>> = row.try_get("reactions")?;
    let deleted_for: Vec<Uuid> = row.try_get("deleted_for")?;

    Ok(Message {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        seq: from_db_seq(row.try_get("seq")?),
        sender_id: row.try_get("sender_id")?,
        message_type,
        content,
        status,
        delivered_at: row.try_get("delivered_at")?,
        read_at: row.try_get("read_at")?,
        edited_at: row.try_get("edited_at")?,
        is_edited: row.try_get("is_edited")?,
        reply_to: row.try_get("reply_to")?,
        forwarded_from: row.try_get("forwarded_from")?,
        reactions,
        is_deleted: row.try_get("is_deleted")?,
        deleted_at: row.try_get("deleted_at")?,
        deleted_for: deleted_for.into_iter().collect(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Load a chat with its participants. With `lock`, the chat row and every
/// participant row stay locked until the surrounding transaction ends.
async fn load_chat<C: GenericClient + Sync>(
    db: &C,
    chat_id: Uuid,
    lock: bool,
) -> AppResult<Option<(Chat, u64)>> {
    let lock_clause = if lock { " FOR UPDATE" } else { "" };

    let sql = format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = $1{lock_clause}");
    let row = match db.query_opt(sql.as_str(), &[&chat_id]).await? {
        Some(row) => row,
        None => return Ok(None),
    };
    let sql = format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM chat_participants WHERE chat_id = $1 \
         ORDER BY position{lock_clause}"
    );
    let participant_rows = db.query(sql.as_str(), &[&chat_id]).await?;
    chat_from_rows(&row, &participant_rows).map(Some)
}

async fn chat_exists<C: GenericClient + Sync>(db: &C, chat_id: Uuid) -> AppResult<bool> {
    Ok(db
        .query_opt("SELECT 1 FROM chats WHERE id = $1", &[&chat_id])
        .await?
        .is_some())
}

async fn insert_chat_rows<C: GenericClient + Sync>(db: &C, chat: &Chat) -> AppResult<()> {
    db.execute(
        "INSERT INTO chats (id, chat_type, group_info, settings, is_deleted, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
        &[
            &chat.id,
            &chat_type_to_db(chat.chat_type),
            &chat.group_info.as_ref().map(Json),
            &Json(&chat.settings),
            &chat.is_deleted,
            &chat.created_at,
            &chat.updated_at,
        ],
    )
    .await?;
    for (position, participant) in chat.participants.iter().enumerate() {
        upsert_participant(db, chat, position, participant).await?;
    }
    Ok(())
}

async fn upsert_participant<C: GenericClient + Sync>(
    db: &C,
    chat: &Chat,
    position: usize,
    participant: &Participant,
) -> AppResult<()> {
    let position = i32::try_from(position)
        .map_err(|_| AppError::Storage("participant position out of range".into()))?;
    let archived_at = chat
        .archived_by
        .iter()
        .find(|entry| entry.user_id == participant.user_id)
        .map(|entry| entry.archived_at);

    db.execute(
        "INSERT INTO chat_participants (chat_id, user_id, position, role, is_active, joined_at, \
             left_at, last_seen_message_id, last_seen_at, unread_count, is_muted, muted_until, \
             is_pinned, pinned_at, custom_name, archived_at, read_seq, unread_watermark) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
         ON CONFLICT (chat_id, user_id) DO UPDATE SET \
             role = EXCLUDED.role, is_active = EXCLUDED.is_active, \
             joined_at = EXCLUDED.joined_at, left_at = EXCLUDED.left_at, \
             last_seen_message_id = EXCLUDED.last_seen_message_id, \
             last_seen_at = EXCLUDED.last_seen_at, unread_count = EXCLUDED.unread_count, \
             is_muted = EXCLUDED.is_muted, muted_until = EXCLUDED.muted_until, \
             is_pinned = EXCLUDED.is_pinned, pinned_at = EXCLUDED.pinned_at, \
             custom_name = EXCLUDED.custom_name, archived_at = EXCLUDED.archived_at, \
             read_seq = EXCLUDED.read_seq, unread_watermark = EXCLUDED.unread_watermark",
        &[
            &chat.id,
            &participant.user_id,
            &position,
            &participant.role.to_db(),
            &participant.is_active,
            &participant.joined_at,
            &participant.left_at,
            &participant.last_seen_message_id,
            &participant.last_seen_at,
            &to_db_seq(participant.unread_count),
            &participant.is_muted,
            &participant.muted_until,
            &participant.is_pinned,
            &participant.pinned_at,
            &participant.custom_name,
            &archived_at,
            &to_db_seq(participant.read_seq),
            &to_db_seq(participant.unread_watermark),
        ],
    )
    .await?;
    Ok(())
}

#[async_trait]
impl ChatStore for PgStore {
    async fn insert_chat(&self, chat: Chat) -> AppResult<Chat> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        insert_chat_rows(&*tx, &chat).await?;
        tx.commit().await?;
        Ok(chat)
    }

    async fn insert_direct_chat(&self, chat: Chat) -> AppResult<(Chat, bool)> {
        let (low, high) = direct_pair_of(&chat)?;
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Waits for a concurrent insert of the same pair to finish
        let claimed = tx
            .query_opt(
                "INSERT INTO direct_chat_pairs (user_low, user_high, chat_id) VALUES ($1, $2, $3) \
                 ON CONFLICT (user_low, user_high) DO NOTHING RETURNING chat_id",
                &[&low, &high, &chat.id],
            )
            .await?
            .is_some();

        if !claimed {
            let existing_id: Uuid = tx
                .query_one(
                    "SELECT chat_id FROM direct_chat_pairs \
                     WHERE user_low = $1 AND user_high = $2 FOR UPDATE",
                    &[&low, &high],
                )
                .await?
                .try_get(0)?;
            if let Some((existing, _)) = load_chat(&*tx, existing_id, false).await? {
                if !existing.is_deleted {
                    debug!(chat_id = %existing_id, "Direct chat already exists for pair");
                    return Ok((existing, false));
                }
            }
            tx.execute(
                "UPDATE direct_chat_pairs SET chat_id = $3 WHERE user_low = $1 AND user_high = $2",
                &[&low, &high, &chat.id],
            )
            .await?;
        }

        insert_chat_rows(&*tx, &chat).await?;
        tx.commit().await?;
        Ok((chat, true))
    }

    async fn find_direct_chat(&self, user_a: Uuid, user_b: Uuid) -> AppResult<Option<Chat>> {
        let (low, high) = super::direct_pair_key(user_a, user_b);
        let client = self.pool.get().await?;
        let chat_id: Uuid = match client
            .query_opt(
                "SELECT chat_id FROM direct_chat_pairs WHERE user_low = $1 AND user_high = $2",
                &[&low, &high],
            )
            .await?
        {
            Some(row) => row.try_get(0)?,
            None => return Ok(None),
        };
        Ok(load_chat(&**client, chat_id, false)
            .await?
            .map(|(chat, _)| chat)
            .filter(|chat| !chat.is_deleted))
    }

    async fn get_chat(&self, chat_id: Uuid) -> AppResult<Option<Chat>> {
        let client = self.pool.get().await?;
        Ok(load_chat(&**client, chat_id, false)
            .await?
            .map(|(chat, _)| chat))
    }

    async fn chats_for_user(&self, user_id: Uuid) -> AppResult<Vec<Chat>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE NOT is_deleted AND id IN \
             (SELECT chat_id FROM chat_participants WHERE user_id = $1)"
        );
        let chat_rows = client.query(sql.as_str(), &[&user_id]).await?;
        if chat_rows.is_empty() {
            return Ok(Vec::new());
        }

        let chat_ids = chat_rows
            .iter()
            .map(|row| row.try_get("id"))
            .collect::<Result<Vec<Uuid>, _>>()?;
        let sql = format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM chat_participants WHERE chat_id = ANY($1) \
             ORDER BY chat_id, position"
        );
        let mut participants: HashMap<Uuid, Vec<Row>> = HashMap::new();
        for row in client.query(sql.as_str(), &[&chat_ids]).await? {
            let chat_id: Uuid = row.try_get("chat_id")?;
            participants.entry(chat_id).or_default().push(row);
        }

        chat_rows
            .iter()
            .zip(chat_ids)
            .map(|(row, chat_id)| {
                let rows = participants.remove(&chat_id).unwrap_or_default();
                chat_from_rows(row, &rows).map(|(chat, _)| chat)
            })
            .collect()
    }

    async fn apply_mutation(&self, chat_id: Uuid, mutation: ChatMutation) -> AppResult<Chat> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let (mut chat, head_seq) = load_chat(&*tx, chat_id, true)
            .await?
            .ok_or(AppError::ChatNotFound)?;

        mutation.apply(&mut chat, head_seq, Utc::now())?;

        tx.execute(
            "UPDATE chats SET group_info = $2, settings = $3, updated_at = $4 WHERE id = $1",
            &[
                &chat.id,
                &chat.group_info.as_ref().map(Json),
                &Json(&chat.settings),
                &chat.updated_at,
            ],
        )
        .await?;
        for (position, participant) in chat.participants.iter().enumerate() {
            upsert_participant(&*tx, &chat, position, participant).await?;
        }
        tx.commit().await?;
        Ok(chat)
    }

    async fn update_last_message_if_newer(
        &self,
        chat_id: Uuid,
        candidate: LastMessage,
    ) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE chats SET last_message_id = $2, last_message_preview = $3, \
                     last_message_sender_id = $4, last_message_type = $5, last_message_at = $6, \
                     updated_at = $7 \
                 WHERE id = $1 AND (last_message_at IS NULL \
                     OR (last_message_at, last_message_id) <= ($6, $2))",
                &[
                    &chat_id,
                    &candidate.message_id,
                    &candidate.preview,
                    &candidate.sender_id,
                    &candidate.message_type.as_str(),
                    &candidate.timestamp,
                    &Utc::now(),
                ],
            )
            .await?;
        if updated == 0 && !chat_exists(&**client, chat_id).await? {
            return Err(AppError::ChatNotFound);
        }
        Ok(updated > 0)
    }

    async fn refresh_last_message_preview(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        preview: String,
    ) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE chats SET last_message_preview = $3 WHERE id = $1 AND last_message_id = $2",
                &[&chat_id, &message_id, &preview],
            )
            .await?;
        if updated == 0 && !chat_exists(&**client, chat_id).await? {
            return Err(AppError::ChatNotFound);
        }
        Ok(updated > 0)
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn append_message(&self, mut message: Message) -> AppResult<Message> {
        // timestamptz keeps microseconds; keep the returned message equal to the stored one
        message.created_at = message.created_at.trunc_subsecs(6);
        message.updated_at = message.updated_at.trunc_subsecs(6);
        let deleted_for: Vec<Uuid> = message.deleted_for.iter().copied().collect();

        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "WITH next AS ( \
                     UPDATE chats SET last_seq = last_seq + 1 WHERE id = $2 RETURNING last_seq \
                 ) \
                 INSERT INTO messages (id, chat_id, seq, sender_id, message_type, content, status, \
                     reply_to, forwarded_from, reactions, deleted_for, created_at, updated_at) \
                 SELECT $1::uuid, $2::uuid, next.last_seq, $3::uuid, $4::text, $5::jsonb, \
                     $6::smallint, $7::uuid, $8::uuid, $9::jsonb, $10::uuid[], \
                     $11::timestamptz, $12::timestamptz \
                 FROM next \
                 RETURNING seq",
                &[
                    &message.id,
                    &message.chat_id,
                    &message.sender_id,
                    &message.message_type.as_str(),
                    &Json(&message.content),
                    &message.status.to_db(),
                    &message.reply_to,
                    &message.forwarded_from,
                    &Json(&message.reactions),
                    &deleted_for,
                    &message.created_at,
                    &message.updated_at,
                ],
            )
            .await?
            .ok_or(AppError::ChatNotFound)?;

        message.seq = from_db_seq(row.try_get(0)?);
        Ok(message)
    }

    async fn get_message(&self, chat_id: Uuid, message_id: Uuid) -> AppResult<Option<Message>> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = $1 AND id = $2");
        client
            .query_opt(sql.as_str(), &[&chat_id, &message_id])
            .await?
            .as_ref()
            .map(message_from_row)
            .transpose()
    }

    async fn apply_message_mutation(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        mutation: MessageMutation,
    ) -> AppResult<(Message, bool)> {
        let mut client = self.pool.get().await?;

        if let MessageMutation::AdvanceStatus { next, at } = mutation {
            let sql = format!(
                "UPDATE messages SET status = $3, \
                     delivered_at = CASE WHEN $3 >= 2 THEN COALESCE(delivered_at, $4) \
                         ELSE delivered_at END, \
                     read_at = CASE WHEN $3 = 3 THEN $4 ELSE read_at END, \
                     updated_at = $4 \
                 WHERE chat_id = $1 AND id = $2 AND status < $3 \
                 RETURNING {MESSAGE_COLUMNS}"
            );
            let params: [&(dyn tokio_postgres::types::ToSql + Sync); 4] =
                [&chat_id, &message_id, &next.to_db(), &at];
            if let Some(row) = client.query_opt(sql.as_str(), &params).await? {
                return Ok((message_from_row(&row)?, true));
            }
            let sql =
                format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = $1 AND id = $2");
            let row = client
                .query_opt(sql.as_str(), &[&chat_id, &message_id])
                .await?
                .ok_or(AppError::MessageNotFound)?;
            return Ok((message_from_row(&row)?, false));
        }

        let tx = client.transaction().await?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = $1 AND id = $2 FOR UPDATE"
        );
        let row = tx
            .query_opt(sql.as_str(), &[&chat_id, &message_id])
            .await?
            .ok_or(AppError::MessageNotFound)?;
        let mut message = message_from_row(&row)?;

        if !mutation.apply(&mut message) {
            return Ok((message, false));
        }

        let deleted_for: Vec<Uuid> = message.deleted_for.iter().copied().collect();
        tx.execute(
            "UPDATE messages SET content = $3, status = $4, delivered_at = $5, read_at = $6, \
                 edited_at = $7, is_edited = $8, reactions = $9, is_deleted = $10, \
                 deleted_at = $11, deleted_for = $12, updated_at = $13 \
             WHERE chat_id = $1 AND id = $2",
            &[
                &chat_id,
                &message_id,
                &Json(&message.content),
                &message.status.to_db(),
                &message.delivered_at,
                &message.read_at,
                &message.edited_at,
                &message.is_edited,
                &Json(&message.reactions),
                &message.is_deleted,
                &message.deleted_at,
                &deleted_for,
                &message.updated_at,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok((message, true))
    }

    async fn page(
        &self,
        chat_id: Uuid,
        viewer: Uuid,
        anchor: PageAnchor,
        limit: usize,
    ) -> AppResult<(Vec<Message>, bool)> {
        let fetch = to_db_seq(limit as u64 + 1);
        let client = self.pool.get().await?;
        let visible = "chat_id = $1 AND NOT ($2 = ANY(deleted_for))";

        let (rows, newest_first) = match anchor {
            PageAnchor::Latest => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {visible} \
                     ORDER BY created_at DESC, id DESC LIMIT $3"
                );
                (client.query(sql.as_str(), &[&chat_id, &viewer, &fetch]).await?, true)
            }
            PageAnchor::Before(cursor) => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {visible} \
                     AND (created_at, id) < ($3, $4) ORDER BY created_at DESC, id DESC LIMIT $5"
                );
                let params: [&(dyn tokio_postgres::types::ToSql + Sync); 5] =
                    [&chat_id, &viewer, &cursor.created_at, &cursor.id, &fetch];
                (client.query(sql.as_str(), &params).await?, true)
            }
            PageAnchor::After(cursor) => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {visible} \
                     AND (created_at, id) > ($3, $4) ORDER BY created_at ASC, id ASC LIMIT $5"
                );
                let params: [&(dyn tokio_postgres::types::ToSql + Sync); 5] =
                    [&chat_id, &viewer, &cursor.created_at, &cursor.id, &fetch];
                (client.query(sql.as_str(), &params).await?, false)
            }
        };

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<AppResult<Vec<_>>>()?;
        let has_more = messages.len() > limit;
        messages.truncate(limit);
        if newest_first {
            messages.reverse();
        }
        Ok((messages, has_more))
    }

    async fn last_seq(&self, chat_id: Uuid) -> AppResult<u64> {
        let client = self.pool.get().await?;
        match client
            .query_opt("SELECT last_seq FROM chats WHERE id = $1", &[&chat_id])
            .await?
        {
            Some(row) => Ok(from_db_seq(row.try_get(0)?)),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl UnreadStore for PgStore {
    async fn increment_unread(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        seq: u64,
    ) -> AppResult<Option<u64>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE chat_participants SET unread_count = unread_count + 1 \
                 WHERE chat_id = $1 AND user_id = $2 AND is_active \
                     AND $3 > GREATEST(read_seq, unread_watermark) \
                 RETURNING unread_count",
                &[&chat_id, &user_id, &to_db_seq(seq)],
            )
            .await?;
        row.map(|row| row.try_get(0).map(from_db_seq))
            .transpose()
            .map_err(AppError::from)
    }

    async fn reset_unread(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        cursor: Option<ReadCursor>,
    ) -> AppResult<UnreadReset> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Holding the chat row in share mode keeps appends out until commit,
        // so the recount and the head it is stamped with agree.
        let head: i64 = tx
            .query_opt("SELECT last_seq FROM chats WHERE id = $1 FOR SHARE", &[&chat_id])
            .await?
            .ok_or(AppError::ChatNotFound)?
            .try_get(0)?;
        let participant = tx
            .query_opt(
                "SELECT unread_count, read_seq FROM chat_participants \
                 WHERE chat_id = $1 AND user_id = $2 AND is_active FOR UPDATE",
                &[&chat_id, &user_id],
            )
            .await?
            .ok_or(AppError::NotAParticipant)?;
        let previous_count = from_db_seq(participant.try_get(0)?);
        let mut read_seq: i64 = participant.try_get(1)?;

        let mut cursor_moved = false;
        if let Some(cursor) = cursor {
            let cursor_seq = to_db_seq(cursor.seq);
            if cursor_seq > read_seq {
                tx.execute(
                    "UPDATE chat_participants SET read_seq = $3, last_seen_message_id = $4, \
                         last_seen_at = $5 \
                     WHERE chat_id = $1 AND user_id = $2",
                    &[&chat_id, &user_id, &cursor_seq, &cursor.message_id, &cursor.at],
                )
                .await?;
                read_seq = cursor_seq;
                cursor_moved = true;
            }
        }

        let unread: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM messages \
                 WHERE chat_id = $1 AND seq > $2 AND sender_id <> $3 \
                     AND NOT ($3 = ANY(deleted_for))",
                &[&chat_id, &read_seq, &user_id],
            )
            .await?
            .try_get(0)?;
        tx.execute(
            "UPDATE chat_participants SET unread_count = $3, \
                 unread_watermark = GREATEST(unread_watermark, $4) \
             WHERE chat_id = $1 AND user_id = $2",
            &[&chat_id, &user_id, &unread, &head],
        )
        .await?;
        tx.commit().await?;

        Ok(UnreadReset {
            previous_count,
            unread_count: from_db_seq(unread),
            cursor_moved,
        })
    }
}
