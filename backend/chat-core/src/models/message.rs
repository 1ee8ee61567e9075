use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Preview shown in the chat list once the last message has been deleted for everyone
pub const DELETED_PREVIEW: &str = "This message was deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Voice,
    Video,
    Document,
    Location,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::Document => "document",
            Self::Location => "location",
        }
    }
}

impl MessageType {
    /// Parse the stored string form
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "voice" => Some(Self::Voice),
            "video" => Some(Self::Video),
            "document" => Some(Self::Document),
            "location" => Some(Self::Location),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery lifecycle of a message.
///
/// Variants are declared in lifecycle order so the derived `Ord` is the
/// transition order: a status may only ever move to a greater one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Client-side only; the server never persists this
    Sending,
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        next > *self
    }

    /// Stored as a smallint so the database can compare statuses directly
    pub fn to_db(self) -> i16 {
        self as i16
    }

    pub fn from_db(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Sending),
            1 => Some(Self::Sent),
            2 => Some(Self::Delivered),
            3 => Some(Self::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaContent {
    /// Reference returned by the media store
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl MediaContent {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_name: None,
            file_size: None,
            mime_type: None,
            duration_secs: None,
            thumbnail_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationContent {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Message payload, one variant per [`MessageType`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text { body: String },
    Image(MediaContent),
    Voice(MediaContent),
    Video(MediaContent),
    Document(MediaContent),
    Location(LocationContent),
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text { .. } => MessageType::Text,
            Self::Image(_) => MessageType::Image,
            Self::Voice(_) => MessageType::Voice,
            Self::Video(_) => MessageType::Video,
            Self::Document(_) => MessageType::Document,
            Self::Location(_) => MessageType::Location,
        }
    }

    /// Structural validation against the declared type and size limits
    pub fn validate(&self, declared: MessageType, max_text_length: usize) -> AppResult<()> {
        if self.message_type() != declared {
            return Err(AppError::InvalidContent(format!(
                "declared type `{}` does not match `{}` content",
                declared,
                self.message_type()
            )));
        }

        match self {
            Self::Text { body } => {
                if body.trim().is_empty() {
                    return Err(AppError::InvalidContent("text body is empty".into()));
                }
                let len = body.chars().count();
                if len > max_text_length {
                    return Err(AppError::InvalidContent(format!(
                        "text body has {} characters, limit is {}",
                        len, max_text_length
                    )));
                }
            }
            Self::Image(media) => validate_media(media, Some("image/"))?,
            Self::Voice(media) => validate_media(media, Some("audio/"))?,
            Self::Video(media) => validate_media(media, Some("video/"))?,
            Self::Document(media) => validate_media(media, None)?,
            Self::Location(location) => {
                let lat_ok = location.latitude.is_finite()
                    && (-90.0..=90.0).contains(&location.latitude);
                let lng_ok = location.longitude.is_finite()
                    && (-180.0..=180.0).contains(&location.longitude);
                if !lat_ok || !lng_ok {
                    return Err(AppError::InvalidContent(format!(
                        "coordinates out of range: ({}, {})",
                        location.latitude, location.longitude
                    )));
                }
            }
        }
        Ok(())
    }

    /// Text that must pass moderation before the message is stored
    pub fn moderation_text(&self) -> Option<&str> {
        match self {
            Self::Text { body } => Some(body),
            Self::Location(LocationContent {
                address: Some(address),
                ..
            }) => Some(address),
            _ => None,
        }
    }

    /// Replace the moderated text with the gateway's cleaned version
    pub fn with_cleaned_text(self, cleaned: String) -> Self {
        match self {
            Self::Text { .. } => Self::Text { body: cleaned },
            Self::Location(location) if location.address.is_some() => {
                Self::Location(LocationContent {
                    address: Some(cleaned),
                    ..location
                })
            }
            other => other,
        }
    }

    pub fn preview(&self, max_len: usize) -> String {
        let raw = match self {
            Self::Text { body } => body.as_str(),
            Self::Image(_) => "Photo",
            Self::Voice(_) => "Voice message",
            Self::Video(_) => "Video",
            Self::Document(media) => media.file_name.as_deref().unwrap_or("Document"),
            Self::Location(location) => location.address.as_deref().unwrap_or("Location"),
        };
        truncate_preview(raw, max_len)
    }
}

fn validate_media(media: &MediaContent, mime_prefix: Option<&str>) -> AppResult<()> {
    if media.url.trim().is_empty() {
        return Err(AppError::InvalidContent("media url is empty".into()));
    }
    if let (Some(prefix), Some(mime)) = (mime_prefix, media.mime_type.as_deref()) {
        if !mime.to_ascii_lowercase().starts_with(prefix) {
            return Err(AppError::InvalidContent(format!(
                "mime type `{}` is not `{}*`",
                mime, prefix
            )));
        }
    }
    Ok(())
}

/// Truncate on character boundaries, appending an ellipsis when shortened.
/// The result never exceeds `max_len` characters.
pub fn truncate_preview(message: &str, max_len: usize) -> String {
    if message.chars().count() <= max_len {
        message.to_string()
    } else if max_len <= 3 {
        message.chars().take(max_len).collect()
    } else {
        let truncated: String = message.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    /// Per-chat commit sequence, assigned by the message store on append
    pub seq: u64,
    pub sender_id: Uuid,
    pub message_type: MessageType,
    pub content: MessageContent,
    pub status: MessageStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
    pub reply_to: Option<Uuid>,
    pub forwarded_from: Option<Uuid>,
    pub reactions: Vec<Reaction>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_for: BTreeSet<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// A freshly accepted message; `seq` is filled in by the store.
    pub fn new(
        chat_id: Uuid,
        sender_id: Uuid,
        content: MessageContent,
        reply_to: Option<Uuid>,
        forwarded_from: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            seq: 0,
            sender_id,
            message_type: content.message_type(),
            content,
            status: MessageStatus::Sent,
            delivered_at: None,
            read_at: None,
            edited_at: None,
            is_edited: false,
            reply_to,
            forwarded_from,
            reactions: Vec::new(),
            is_deleted: false,
            deleted_at: None,
            deleted_for: BTreeSet::new(),
            created_at,
            updated_at: created_at,
        }
    }

    pub fn is_visible_to(&self, user_id: Uuid) -> bool {
        !self.deleted_for.contains(&user_id)
    }

    /// Forward-only status transition. Returns false when `next` is not ahead
    /// of the current status, leaving the message untouched.
    pub fn advance_status(&mut self, next: MessageStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        if next >= MessageStatus::Delivered && self.delivered_at.is_none() {
            self.delivered_at = Some(now);
        }
        if next == MessageStatus::Read {
            self.read_at = Some(now);
        }
        self.updated_at = now;
        true
    }

    pub fn preview(&self, max_len: usize) -> String {
        if self.is_deleted {
            DELETED_PREVIEW.to_string()
        } else {
            self.content.preview(max_len)
        }
    }

    /// What `viewer` gets to see, or `None` when the message is hidden for them
    pub fn view_for(&self, viewer: Uuid) -> Option<MessageView> {
        if !self.is_visible_to(viewer) {
            return None;
        }
        Some(MessageView::from(self))
    }
}

/// Outward shape of a message. Tombstones carry no content or reactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub message_type: MessageType,
    pub content: Option<MessageContent>,
    pub status: MessageStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
    pub reply_to: Option<Uuid>,
    pub forwarded_from: Option<Uuid>,
    pub reactions: Vec<Reaction>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        let (content, reactions) = if message.is_deleted {
            (None, Vec::new())
        } else {
            (Some(message.content.clone()), message.reactions.clone())
        };
        Self {
            id: message.id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            message_type: message.message_type,
            content,
            status: message.status,
            delivered_at: message.delivered_at,
            read_at: message.read_at,
            edited_at: message.edited_at,
            is_edited: message.is_edited,
            reply_to: message.reply_to,
            forwarded_from: message.forwarded_from,
            reactions,
            is_deleted: message.is_deleted,
            deleted_at: message.deleted_at,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub message_type: MessageType,
    pub content: MessageContent,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub forwarded_from: Option<Uuid>,
}

impl SendMessageRequest {
    pub fn new(content: MessageContent) -> Self {
        Self {
            message_type: content.message_type(),
            content,
            reply_to: None,
            forwarded_from: None,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(MessageContent::text(body))
    }

    pub fn replying_to(mut self, message_id: Uuid) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteScope {
    ForEveryone,
    ForMe,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_preview() {
        assert_eq!(truncate_preview("Hello", 100), "Hello");
        assert_eq!(truncate_preview("Hello world!", 8), "Hello...");
        assert_eq!(truncate_preview("héllo wörld", 8), "héllo...");
    }

    #[test]
    fn test_truncate_preview_never_exceeds_limit() {
        assert_eq!(truncate_preview("Hello", 2), "He");
        assert_eq!(truncate_preview("Hello", 3), "Hel");
        assert_eq!(truncate_preview("Hello", 0), "");
        assert_eq!(truncate_preview("Hello!", 4), "H...");
    }

    #[test]
    fn test_status_db_form_preserves_order() {
        let all = [
            MessageStatus::Sending,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
        ];
        for pair in all.windows(2) {
            assert!(pair[0].to_db() < pair[1].to_db());
        }
        for status in all {
            assert_eq!(MessageStatus::from_db(status.to_db()), Some(status));
        }
        assert_eq!(MessageStatus::from_db(9), None);
        assert_eq!(MessageType::from_db("voice"), Some(MessageType::Voice));
        assert_eq!(MessageType::from_db("sticker"), None);
    }

    #[test]
    fn test_status_only_moves_forward() {
        let now = Utc::now();
        let mut msg = Message::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            MessageContent::text("hi"),
            None,
            None,
            now,
        );
        assert!(msg.advance_status(MessageStatus::Read, now));
        assert!(msg.delivered_at.is_some());
        assert!(msg.read_at.is_some());
        assert!(!msg.advance_status(MessageStatus::Delivered, now));
        assert!(!msg.advance_status(MessageStatus::Sent, now));
        assert_eq!(msg.status, MessageStatus::Read);
    }

    #[test]
    fn test_validate_rejects_type_mismatch() {
        let content = MessageContent::text("hello");
        let err = content.validate(MessageType::Image, 100).unwrap_err();
        assert!(matches!(err, AppError::InvalidContent(_)));
    }

    #[test]
    fn test_validate_text_limits() {
        assert!(MessageContent::text("   ")
            .validate(MessageType::Text, 10)
            .is_err());
        assert!(MessageContent::text("x".repeat(11))
            .validate(MessageType::Text, 10)
            .is_err());
        assert!(MessageContent::text("x".repeat(10))
            .validate(MessageType::Text, 10)
            .is_ok());
    }

    #[test]
    fn test_validate_media_and_location() {
        let mut image = MediaContent::new("media://abc");
        image.mime_type = Some("video/mp4".into());
        assert!(MessageContent::Image(image.clone())
            .validate(MessageType::Image, 10)
            .is_err());
        image.mime_type = Some("image/png".into());
        assert!(MessageContent::Image(image)
            .validate(MessageType::Image, 10)
            .is_ok());
        assert!(MessageContent::Voice(MediaContent::new(""))
            .validate(MessageType::Voice, 10)
            .is_err());

        let bad = MessageContent::Location(LocationContent {
            latitude: 91.0,
            longitude: 0.0,
            address: None,
        });
        assert!(bad.validate(MessageType::Location, 10).is_err());
    }

    #[test]
    fn test_content_serialization_is_tagged() {
        let json = serde_json::to_value(MessageContent::text("hey")).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["body"], "hey");

        let parsed: MessageContent = serde_json::from_value(serde_json::json!({
            "type": "image",
            "url": "media://1",
            "mime_type": "image/jpeg"
        }))
        .unwrap();
        assert_eq!(parsed.message_type(), MessageType::Image);
    }

    #[test]
    fn test_tombstone_view_hides_content() {
        let now = Utc::now();
        let viewer = Uuid::new_v4();
        let mut msg = Message::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            MessageContent::text("secret"),
            None,
            None,
            now,
        );
        msg.reactions.push(Reaction {
            user_id: viewer,
            emoji: "👍".into(),
            created_at: now,
        });
        msg.is_deleted = true;

        let view = msg.view_for(viewer).unwrap();
        assert!(view.content.is_none());
        assert!(view.reactions.is_empty());
        assert_eq!(msg.preview(100), DELETED_PREVIEW);

        msg.deleted_for.insert(viewer);
        assert!(msg.view_for(viewer).is_none());
    }
}
