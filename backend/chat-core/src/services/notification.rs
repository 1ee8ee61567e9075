//! Notification hand-off
//!
//! The core only decides who should be notified and with what preview;
//! delivery (push, email) belongs to the notification service behind
//! [`NotificationGateway`]. Hand-off is fire-and-forget.

use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewMessage,
    NewChat,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::NewMessage => write!(f, "new_message"),
            NotificationKind::NewChat => write!(f, "new_chat"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub chat_id: Uuid,
    pub recipient_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub message_id: Option<Uuid>,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify(&self, request: NotificationRequest) -> AppResult<()>;
}

/// Emits a structured log line per request; useful where no push pipeline exists
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl NotificationGateway for LoggingNotifier {
    async fn notify(&self, request: NotificationRequest) -> AppResult<()> {
        tracing::info!(
            recipient_id = %request.recipient_id,
            chat_id = %request.chat_id,
            kind = %request.kind,
            "Notification requested"
        );
        Ok(())
    }
}

/// Hand requests to the gateway on a background task. Failures are logged
/// and never reach the caller.
pub fn dispatch(gateway: Arc<dyn NotificationGateway>, requests: Vec<NotificationRequest>) {
    if requests.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for request in requests {
            let recipient_id = request.recipient_id;
            let kind = request.kind;
            if let Err(e) = gateway.notify(request).await {
                tracing::warn!(
                    error = %e,
                    recipient_id = %recipient_id,
                    kind = %kind,
                    "Failed to hand off notification"
                );
            }
        }
    });
}
