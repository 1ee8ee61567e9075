// Message visibility, editing, moderation and history pagination

mod common;

use chat_core::error::AppError;
use chat_core::fanout::Channel;
use chat_core::models::{
    DeleteScope, MessageContent, MessageType, PageRequest, SendMessageRequest,
};
use chat_core::services::KeywordModerator;
use common::{drain_event_types, text_of, Harness};
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn test_delete_for_me_hides_only_for_requester() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat = h.direct(a, b).await;
    let keep = h.send(chat.id, a, "keep").await;
    let hide = h.send(chat.id, a, "hide").await;
    assert_eq!(h.unread(b, chat.id).await, 2);

    h.core
        .messages
        .delete_message(chat.id, b, hide.id, DeleteScope::ForMe)
        .await
        .unwrap();

    let for_b = h
        .core
        .messages
        .get_chat_messages(chat.id, b, PageRequest::default())
        .await
        .unwrap();
    let ids: Vec<Uuid> = for_b.messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![keep.id]);

    let for_a = h
        .core
        .messages
        .get_chat_messages(chat.id, a, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(for_a.messages.len(), 2);

    // Hidden messages no longer count as unread.
    assert_eq!(h.unread(b, chat.id).await, 1);

    let err = h
        .core
        .messages
        .get_message(chat.id, b, hide.id)
        .await
        .unwrap_err();
    assert_eq!(err, AppError::MessageNotFound);
}

#[tokio::test]
async fn test_delete_for_everyone_leaves_tombstone() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat = h.direct(a, b).await;
    let message = h.send(chat.id, a, "secret").await;
    h.core
        .messages
        .add_reaction(chat.id, b, message.id, "👍")
        .await
        .unwrap();

    let err = h
        .core
        .messages
        .delete_message(chat.id, b, message.id, DeleteScope::ForEveryone)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));

    let mut events = h.subscribe(Channel::Chat(chat.id)).await;
    h.core
        .messages
        .delete_message(chat.id, a, message.id, DeleteScope::ForEveryone)
        .await
        .unwrap();
    assert_eq!(drain_event_types(&mut events), vec!["message_deleted"]);

    for viewer in [a, b] {
        let page = h
            .core
            .messages
            .get_chat_messages(chat.id, viewer, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        let tombstone = &page.messages[0];
        assert!(tombstone.is_deleted);
        assert!(tombstone.content.is_none());
        assert!(tombstone.reactions.is_empty());
    }

    let summary = h.summary(b, chat.id).await;
    assert_eq!(
        summary.last_message.unwrap().preview,
        "This message was deleted"
    );

    let err = h
        .core
        .messages
        .edit_message(chat.id, a, message.id, MessageContent::text("again"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn test_group_admin_can_delete_for_everyone() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let c = h.user("Carol");
    let group = h.group(a, &[b, c]).await;
    let message = h.send(group.id, b, "spam").await;

    h.core
        .messages
        .delete_message(group.id, a, message.id, DeleteScope::ForEveryone)
        .await
        .unwrap();
    let view = h.core.messages.get_message(group.id, c, message.id).await.unwrap();
    assert!(view.is_deleted);
}

#[tokio::test]
async fn test_edit_updates_content_and_preview() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat = h.direct(a, b).await;
    let message = h.send(chat.id, a, "helo").await;

    let err = h
        .core
        .messages
        .edit_message(chat.id, b, message.id, MessageContent::text("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));

    let edited = h
        .core
        .messages
        .edit_message(chat.id, a, message.id, MessageContent::text("hello"))
        .await
        .unwrap();
    assert!(edited.is_edited);
    assert!(edited.edited_at.is_some());

    let view = h.core.messages.get_message(chat.id, b, message.id).await.unwrap();
    assert_eq!(text_of(&view.content), Some("hello"));
    assert_eq!(h.summary(b, chat.id).await.last_message.unwrap().preview, "hello");
}

#[tokio::test]
async fn test_reactions_are_deduplicated() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat = h.direct(a, b).await;
    let message = h.send(chat.id, a, "hi").await;

    h.core.messages.add_reaction(chat.id, b, message.id, "🎉").await.unwrap();
    let after = h.core.messages.add_reaction(chat.id, b, message.id, "🎉").await.unwrap();
    assert_eq!(after.reactions.len(), 1);

    let after = h
        .core
        .messages
        .remove_reaction(chat.id, b, message.id, "🎉")
        .await
        .unwrap();
    assert!(after.reactions.is_empty());

    let err = h
        .core
        .messages
        .add_reaction(chat.id, b, message.id, "")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidContent(_)));
}

#[tokio::test]
async fn test_moderation_rejects_or_masks() {
    let h = Harness::with_moderation(Arc::new(KeywordModerator::new(["scam"], ["darn"])));
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat = h.direct(a, b).await;

    let err = h
        .core
        .messages
        .send_message(chat.id, a, SendMessageRequest::text("free scam here"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AppError::ContentRejected {
            flags: vec!["blocked_word: scam".to_string()]
        }
    );
    assert_eq!(h.unread(b, chat.id).await, 0);
    assert!(h.summary(b, chat.id).await.last_message.is_none());

    let masked = h.send(chat.id, a, "oh darn it").await;
    assert_eq!(masked.content, MessageContent::text("oh **** it"));
}

#[tokio::test]
async fn test_invalid_content_is_not_persisted() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat = h.direct(a, b).await;

    let empty = h
        .core
        .messages
        .send_message(chat.id, a, SendMessageRequest::text("   "))
        .await
        .unwrap_err();
    assert!(matches!(empty, AppError::InvalidContent(_)));

    let too_long = h
        .core
        .messages
        .send_message(chat.id, a, SendMessageRequest::text("x".repeat(4097)))
        .await
        .unwrap_err();
    assert!(matches!(too_long, AppError::InvalidContent(_)));

    let mut mismatched = SendMessageRequest::text("hi");
    mismatched.message_type = MessageType::Image;
    let err = h
        .core
        .messages
        .send_message(chat.id, a, mismatched)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidContent(_)));

    let dangling = SendMessageRequest::text("re").replying_to(Uuid::new_v4());
    let err = h
        .core
        .messages
        .send_message(chat.id, a, dangling)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidContent(_)));

    let page = h
        .core
        .messages
        .get_chat_messages(chat.id, a, PageRequest::default())
        .await
        .unwrap();
    assert!(page.messages.is_empty());
    assert!(!page.has_more);
}

#[tokio::test]
async fn test_outsiders_cannot_read_history() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let eve = h.user("Eve");
    let chat = h.direct(a, b).await;
    h.send(chat.id, a, "private").await;

    let err = h
        .core
        .messages
        .get_chat_messages(chat.id, eve, PageRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err, AppError::NotAParticipant);

    let err = h
        .core
        .messages
        .get_chat_messages(Uuid::new_v4(), a, PageRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err, AppError::ChatNotFound);
}

#[tokio::test]
async fn test_pagination_is_stable_across_new_messages() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat = h.direct(a, b).await;

    let mut sent = Vec::new();
    for i in 0..7 {
        sent.push(h.send(chat.id, a, &format!("m{}", i)).await.id);
    }

    let latest = h
        .core
        .messages
        .get_chat_messages(chat.id, b, PageRequest::latest(3))
        .await
        .unwrap();
    let ids: Vec<Uuid> = latest.messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, sent[4..].to_vec());
    assert!(latest.has_more);

    // New traffic must not shift older pages.
    h.send(chat.id, b, "interleaved").await;

    let older = h
        .core
        .messages
        .get_chat_messages(
            chat.id,
            b,
            PageRequest::before(latest.prev_cursor.clone().unwrap(), 3),
        )
        .await
        .unwrap();
    let ids: Vec<Uuid> = older.messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, sent[1..4].to_vec());
    assert!(older.has_more);

    let oldest = h
        .core
        .messages
        .get_chat_messages(
            chat.id,
            b,
            PageRequest::before(older.prev_cursor.clone().unwrap(), 3),
        )
        .await
        .unwrap();
    let ids: Vec<Uuid> = oldest.messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, sent[..1].to_vec());
    assert!(!oldest.has_more);

    let newer = h
        .core
        .messages
        .get_chat_messages(
            chat.id,
            b,
            PageRequest::after(latest.next_cursor.clone().unwrap(), 10),
        )
        .await
        .unwrap();
    assert_eq!(newer.messages.len(), 1);
    assert_eq!(text_of(&newer.messages[0].content), Some("interleaved"));
    assert!(!newer.has_more);
}

#[tokio::test]
async fn test_malformed_cursor_is_rejected() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat = h.direct(a, b).await;

    let err = h
        .core
        .messages
        .get_chat_messages(chat.id, a, PageRequest::before("not-a-cursor", 10))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let both = PageRequest {
        before: Some("x".into()),
        after: Some("y".into()),
        limit: None,
    };
    let err = h
        .core
        .messages
        .get_chat_messages(chat.id, a, both)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}
