use super::member::MemberRole;
use super::message::MessageType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub role: MemberRole,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub last_seen_message_id: Option<Uuid>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub unread_count: u64,
    pub is_muted: bool,
    pub muted_until: Option<DateTime<Utc>>,
    pub is_pinned: bool,
    pub pinned_at: Option<DateTime<Utc>>,
    pub custom_name: Option<String>,
    /// Commit sequence of the read cursor (chat head at join time if nothing read yet)
    #[serde(skip)]
    pub read_seq: u64,
    /// Highest commit sequence already reflected in `unread_count` by a recompute
    #[serde(skip)]
    pub unread_watermark: u64,
}

impl Participant {
    pub fn new(user_id: Uuid, role: MemberRole, joined_at: DateTime<Utc>, head_seq: u64) -> Self {
        Self {
            user_id,
            role,
            is_active: true,
            joined_at,
            left_at: None,
            last_seen_message_id: None,
            last_seen_at: None,
            unread_count: 0,
            is_muted: false,
            muted_until: None,
            is_pinned: false,
            pinned_at: None,
            custom_name: None,
            read_seq: head_seq,
            unread_watermark: head_seq,
        }
    }

    /// Muted, honouring a timed mute that has since lapsed
    pub fn is_muted_at(&self, now: DateTime<Utc>) -> bool {
        match (self.is_muted, self.muted_until) {
            (false, _) => false,
            (true, None) => true,
            (true, Some(until)) => until > now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    AdminsOnly,
    AllMembers,
}

impl PermissionLevel {
    pub fn allows(&self, role: MemberRole) -> bool {
        match self {
            Self::AdminsOnly => role.is_privileged(),
            Self::AllMembers => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPermissions {
    pub add_members: PermissionLevel,
    pub edit_info: PermissionLevel,
    pub send_messages: PermissionLevel,
}

impl Default for GroupPermissions {
    fn default() -> Self {
        Self {
            add_members: PermissionLevel::AdminsOnly,
            edit_info: PermissionLevel::AdminsOnly,
            send_messages: PermissionLevel::AllMembers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub description: Option<String>,
    pub avatar: Option<String>,
    pub created_by: Uuid,
    /// Kept in sync with participants whose role is admin
    pub admins: Vec<Uuid>,
    pub permissions: GroupPermissions,
}

/// Partial update of group info; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupInfoPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<String>,
    pub permissions: Option<GroupPermissions>,
}

impl GroupInfoPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.avatar.is_none()
            && self.permissions.is_none()
    }
}

/// Cached projection of the newest message; never authoritative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub message_id: Uuid,
    pub preview: String,
    pub sender_id: Uuid,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
}

impl LastMessage {
    /// Total order used by the conditional cache update: timestamp, then id
    pub fn recency_cmp(&self, other: &LastMessage) -> Ordering {
        (self.timestamp, self.message_id).cmp(&(other.timestamp, other.message_id))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisappearingMessages {
    pub enabled: bool,
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSettings {
    pub enabled: bool,
    pub key_rotation_interval_secs: Option<u64>,
}

/// Chat-level settings. Stored as configuration only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    pub disappearing_messages: DisappearingMessages,
    pub encryption: EncryptionSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub user_id: Uuid,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub chat_type: ChatType,
    pub participants: Vec<Participant>,
    pub group_info: Option<GroupInfo>,
    pub last_message: Option<LastMessage>,
    pub settings: ChatSettings,
    pub is_archived: bool,
    pub archived_by: Vec<ArchiveEntry>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(
        chat_type: ChatType,
        participants: Vec<Participant>,
        group_info: Option<GroupInfo>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_type,
            participants,
            group_info,
            last_message: None,
            settings: ChatSettings::default(),
            is_archived: false,
            archived_by: Vec::new(),
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn participant(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: Uuid) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn active_participant(&self, user_id: Uuid) -> Option<&Participant> {
        self.participant(user_id).filter(|p| p.is_active)
    }

    pub fn is_active_participant(&self, user_id: Uuid) -> bool {
        self.active_participant(user_id).is_some()
    }

    pub fn active_member_ids(&self) -> Vec<Uuid> {
        self.participants
            .iter()
            .filter(|p| p.is_active)
            .map(|p| p.user_id)
            .collect()
    }

    pub fn is_archived_for(&self, user_id: Uuid) -> bool {
        self.archived_by.iter().any(|a| a.user_id == user_id)
    }

    /// Sort key for chat lists: newest activity first
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|m| m.timestamp)
            .unwrap_or(self.created_at)
    }

    /// Recompute `group_info.admins` from participant roles
    pub fn sync_admins(&mut self) {
        let admins: Vec<Uuid> = self
            .participants
            .iter()
            .filter(|p| p.is_active && p.role.is_privileged())
            .map(|p| p.user_id)
            .collect();
        if let Some(info) = self.group_info.as_mut() {
            info.admins = admins;
        }
    }
}

/// A chat as it appears in one user's chat list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: Uuid,
    pub chat_type: ChatType,
    pub display_name: Option<String>,
    pub last_message: Option<LastMessage>,
    pub unread_count: u64,
    pub is_muted: bool,
    pub is_pinned: bool,
    pub is_archived: bool,
    pub participant_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSummary {
    pub fn for_viewer(chat: &Chat, viewer: &Participant, now: DateTime<Utc>) -> Self {
        let display_name = viewer
            .custom_name
            .clone()
            .or_else(|| chat.group_info.as_ref().map(|g| g.name.clone()));
        Self {
            chat_id: chat.id,
            chat_type: chat.chat_type,
            display_name,
            last_message: chat.last_message.clone(),
            unread_count: viewer.unread_count,
            is_muted: viewer.is_muted_at(now),
            is_pinned: viewer.is_pinned,
            is_archived: chat.is_archived_for(viewer.user_id),
            participant_ids: chat.active_member_ids(),
            created_at: chat.created_at,
            updated_at: chat.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timed_mute_expires() {
        let now = Utc::now();
        let mut p = Participant::new(Uuid::new_v4(), MemberRole::Member, now, 0);
        assert!(!p.is_muted_at(now));

        p.is_muted = true;
        assert!(p.is_muted_at(now));

        p.muted_until = Some(now + Duration::minutes(5));
        assert!(p.is_muted_at(now));
        assert!(!p.is_muted_at(now + Duration::minutes(6)));
    }

    #[test]
    fn test_last_message_ties_break_on_id() {
        let ts = Utc::now();
        let a = LastMessage {
            message_id: Uuid::from_u128(1),
            preview: "a".into(),
            sender_id: Uuid::new_v4(),
            message_type: MessageType::Text,
            timestamp: ts,
        };
        let b = LastMessage {
            message_id: Uuid::from_u128(2),
            ..a.clone()
        };
        assert_eq!(a.recency_cmp(&b), Ordering::Less);
        assert_eq!(b.recency_cmp(&a), Ordering::Greater);
    }

    #[test]
    fn test_default_group_permissions() {
        let perms = GroupPermissions::default();
        assert!(!perms.add_members.allows(MemberRole::Member));
        assert!(perms.add_members.allows(MemberRole::Admin));
        assert!(perms.send_messages.allows(MemberRole::Member));
    }

    #[test]
    fn test_sync_admins_tracks_active_admins() {
        let now = Utc::now();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut chat = Chat::new(
            ChatType::Group,
            vec![
                Participant::new(owner, MemberRole::Admin, now, 0),
                Participant::new(other, MemberRole::Member, now, 0),
            ],
            Some(GroupInfo {
                name: "team".into(),
                description: None,
                avatar: None,
                created_by: owner,
                admins: vec![],
                permissions: GroupPermissions::default(),
            }),
            now,
        );
        chat.sync_admins();
        assert_eq!(chat.group_info.as_ref().unwrap().admins, vec![owner]);

        chat.participant_mut(other).unwrap().role = MemberRole::Admin;
        chat.participant_mut(owner).unwrap().is_active = false;
        chat.sync_admins();
        assert_eq!(chat.group_info.as_ref().unwrap().admins, vec![other]);
    }
}
