pub mod chat;
pub mod cursor;
pub mod member;
pub mod message;

pub use chat::{
    ArchiveEntry, Chat, ChatSettings, ChatSummary, ChatType, DisappearingMessages,
    EncryptionSettings, GroupInfo, GroupInfoPatch, GroupPermissions, LastMessage, Participant,
    PermissionLevel,
};
pub use cursor::{MessageCursor, MessagePage, PageAnchor, PageRequest};
pub use member::MemberRole;
pub use message::{
    DeleteScope, LocationContent, MediaContent, Message, MessageContent, MessageStatus,
    MessageType, MessageView, Reaction, SendMessageRequest,
};
