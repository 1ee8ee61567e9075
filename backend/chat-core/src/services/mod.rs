pub mod conversation_service;
pub mod directory;
pub mod message_service;
pub mod moderation;
pub mod notification;
pub mod read_service;
pub mod retry;
pub mod unread_tracker;

// Re-export key types for convenience
pub use conversation_service::{ConversationService, NewGroup};
pub use directory::{InMemoryDirectory, UserDirectory};
pub use message_service::MessageService;
pub use moderation::{AllowAllModerator, KeywordModerator, ModerationGateway, ModerationVerdict};
pub use notification::{
    LoggingNotifier, NotificationGateway, NotificationKind, NotificationRequest,
};
pub use read_service::{ReadReceipt, ReadService};
pub use retry::{with_retry, RetryConfig};
pub use unread_tracker::UnreadTracker;
