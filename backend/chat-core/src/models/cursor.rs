//! Keyset cursors for message history.
//!
//! A cursor pins a position in the `(created_at, id)` order of a chat's
//! messages, so pages stay stable while new messages arrive.

use super::message::{Message, MessageView};
use crate::error::{AppError, AppResult};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl MessageCursor {
    pub fn of(message: &Message) -> Self {
        Self {
            created_at: message.created_at,
            id: message.id,
        }
    }

    /// Format: base64url("id:<uuid>,ts:<rfc3339 nanos>")
    pub fn encode(&self) -> String {
        let raw = format!(
            "id:{},ts:{}",
            self.id,
            self.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
        );
        general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(cursor: &str) -> AppResult<Self> {
        let decoded = general_purpose::URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|e| AppError::BadRequest(format!("Invalid cursor format: {}", e)))?;
        let raw = String::from_utf8(decoded)
            .map_err(|e| AppError::BadRequest(format!("Cursor not valid UTF-8: {}", e)))?;

        let (id_part, ts_part) = raw
            .split_once(',')
            .ok_or_else(|| AppError::BadRequest("Invalid keyset cursor format".into()))?;

        let id = id_part
            .strip_prefix("id:")
            .ok_or_else(|| AppError::BadRequest("Missing id prefix".into()))?
            .parse::<Uuid>()
            .map_err(|e| AppError::BadRequest(format!("Invalid cursor id: {}", e)))?;

        let created_at = ts_part
            .strip_prefix("ts:")
            .ok_or_else(|| AppError::BadRequest("Missing ts prefix".into()))
            .and_then(|ts| {
                DateTime::parse_from_rfc3339(ts)
                    .map_err(|e| AppError::BadRequest(format!("Invalid cursor timestamp: {}", e)))
            })?
            .with_timezone(&Utc);

        Ok(Self { created_at, id })
    }
}

/// Page request for `get_chat_messages`.
///
/// With neither cursor set the newest page is returned. `before` and `after`
/// are mutually exclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageRequest {
    pub before: Option<String>,
    pub after: Option<String>,
    pub limit: Option<usize>,
}

impl PageRequest {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn before(cursor: impl Into<String>, limit: usize) -> Self {
        Self {
            before: Some(cursor.into()),
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn after(cursor: impl Into<String>, limit: usize) -> Self {
        Self {
            after: Some(cursor.into()),
            limit: Some(limit),
            ..Default::default()
        }
    }
}

/// Resolved page boundary handed to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAnchor {
    Latest,
    Before(MessageCursor),
    After(MessageCursor),
}

impl PageAnchor {
    pub fn from_request(request: &PageRequest) -> AppResult<Self> {
        match (request.before.as_deref(), request.after.as_deref()) {
            (Some(_), Some(_)) => Err(AppError::BadRequest(
                "before and after cursors are mutually exclusive".into(),
            )),
            (Some(before), None) => Ok(Self::Before(MessageCursor::decode(before)?)),
            (None, Some(after)) => Ok(Self::After(MessageCursor::decode(after)?)),
            (None, None) => Ok(Self::Latest),
        }
    }
}

/// Messages ordered oldest to newest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessageView>,
    /// More messages exist beyond this page in the paging direction
    pub has_more: bool,
    /// Cursor of the oldest message on the page (use with `before`)
    pub prev_cursor: Option<String>,
    /// Cursor of the newest message on the page (use with `after`)
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip_preserves_nanos() {
        let cursor = MessageCursor {
            created_at: Utc::now(),
            id: Uuid::new_v4(),
        };
        let decoded = MessageCursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_malformed_cursor_is_bad_request() {
        assert!(matches!(
            MessageCursor::decode("not a cursor!"),
            Err(AppError::BadRequest(_))
        ));
        let wrong = general_purpose::URL_SAFE_NO_PAD.encode("offset:10");
        assert!(matches!(
            MessageCursor::decode(&wrong),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_anchor_rejects_both_directions() {
        let cursor = MessageCursor {
            created_at: Utc::now(),
            id: Uuid::new_v4(),
        }
        .encode();
        let request = PageRequest {
            before: Some(cursor.clone()),
            after: Some(cursor),
            limit: None,
        };
        assert!(PageAnchor::from_request(&request).is_err());
        assert_eq!(
            PageAnchor::from_request(&PageRequest::default()).unwrap(),
            PageAnchor::Latest
        );
    }
}
