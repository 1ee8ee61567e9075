// Unread counter and status consistency under concurrency
//
// Sends, reads and delivery receipts race on multi-threaded runtimes; the
// assertions check counters against the message log afterwards.

mod common;

use chat_core::models::{MessageStatus, PageRequest};
use chat_core::store::ChatStore;
use common::{DelayingModerator, Harness};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn test_send_increments_every_other_participant() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let c = h.user("Carol");
    let group = h.group(a, &[b, c]).await;

    h.send(group.id, b, "one").await;
    assert_eq!(h.unread(a, group.id).await, 1);
    assert_eq!(h.unread(b, group.id).await, 0);
    assert_eq!(h.unread(c, group.id).await, 1);

    h.send(group.id, a, "two").await;
    assert_eq!(h.unread(a, group.id).await, 1);
    assert_eq!(h.unread(b, group.id).await, 1);
    assert_eq!(h.unread(c, group.id).await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_count_exactly() {
    let h = Arc::new(Harness::new());
    let users = [h.user("Alice"), h.user("Bob"), h.user("Carol")];
    let chat_id = h.group(users[0], &users[1..]).await.id;

    let per_sender = 10;
    let tasks = users.iter().flat_map(|&sender| {
        let h = h.clone();
        (0..per_sender).map(move |i| {
            let h = h.clone();
            tokio::spawn(async move { h.send(chat_id, sender, &format!("m{}", i)).await })
        })
    });
    for result in join_all(tasks.collect::<Vec<_>>()).await {
        result.unwrap();
    }

    for &user in &users {
        assert_eq!(h.unread(user, chat_id).await, 2 * per_sender as u64);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unread_matches_log_after_send_read_race() {
    let h = Arc::new(Harness::new());
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat_id = h.direct(a, b).await.id;

    let sender = {
        let h = h.clone();
        tokio::spawn(async move {
            let mut sent = Vec::new();
            for i in 0..40 {
                sent.push(h.send(chat_id, a, &format!("m{}", i)).await);
                tokio::task::yield_now().await;
            }
            sent
        })
    };
    let reader = {
        let h = h.clone();
        tokio::spawn(async move {
            for _ in 0..40 {
                let page = h
                    .core
                    .messages
                    .get_chat_messages(chat_id, b, PageRequest::latest(5))
                    .await
                    .unwrap();
                let ids: Vec<Uuid> = page.messages.iter().map(|m| m.id).collect();
                h.core
                    .reads
                    .mark_messages_as_read(chat_id, b, &ids)
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let sent = sender.await.unwrap();
    reader.await.unwrap();

    let stored = h.store.get_chat(chat_id).await.unwrap().unwrap();
    let read_seq = stored.participant(b).unwrap().read_seq;
    let expected = sent.iter().filter(|m| m.seq > read_seq).count() as u64;
    assert_eq!(h.unread(b, chat_id).await, expected);

    let all: Vec<Uuid> = sent.iter().map(|m| m.id).collect();
    let receipt = h
        .core
        .reads
        .mark_messages_as_read(chat_id, b, &all)
        .await
        .unwrap();
    assert_eq!(receipt.unread_count, 0);
    assert_eq!(h.unread(b, chat_id).await, 0);
}

#[tokio::test]
async fn test_read_is_idempotent() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat = h.direct(a, b).await;
    let first = h.send(chat.id, a, "one").await;
    let second = h.send(chat.id, a, "two").await;

    let receipt = h
        .core
        .reads
        .mark_messages_as_read(chat.id, b, &[first.id, second.id])
        .await
        .unwrap();
    assert_eq!(receipt.read_message_ids.len(), 2);
    assert_eq!(receipt.last_seen_message_id, Some(second.id));

    let mut chat_events = h.subscribe(chat_core::fanout::Channel::Chat(chat.id)).await;
    let mut user_events = h.subscribe(chat_core::fanout::Channel::User(b)).await;

    let again = h
        .core
        .reads
        .mark_messages_as_read(chat.id, b, &[second.id, first.id])
        .await
        .unwrap();
    assert!(again.read_message_ids.is_empty());
    assert_eq!(again.unread_count, 0);
    assert_eq!(again.last_seen_message_id, Some(second.id));

    // Acknowledging an older message never moves the cursor back.
    let subset = h
        .core
        .reads
        .mark_messages_as_read(chat.id, b, &[first.id])
        .await
        .unwrap();
    assert_eq!(subset.last_seen_message_id, Some(second.id));

    assert!(chat_events.try_recv().is_err());
    assert!(user_events.try_recv().is_err());
}

#[tokio::test]
async fn test_read_skips_own_and_foreign_messages() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let c = h.user("Carol");
    let chat = h.direct(a, b).await;
    let other = h.direct(a, c).await;

    let own = h.send(chat.id, b, "mine").await;
    let foreign = h.send(other.id, a, "elsewhere").await;

    let receipt = h
        .core
        .reads
        .mark_messages_as_read(chat.id, b, &[own.id, foreign.id])
        .await
        .unwrap();
    assert!(receipt.read_message_ids.is_empty());

    let view = h.core.messages.get_message(chat.id, a, own.id).await.unwrap();
    assert_eq!(view.status, MessageStatus::Sent);
    assert_eq!(h.unread(c, other.id).await, 1);
}

#[tokio::test]
async fn test_status_never_moves_backwards() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat = h.direct(a, b).await;
    let message = h.send(chat.id, a, "hi").await;

    let delivered = h
        .core
        .messages
        .mark_delivered(chat.id, b, &[message.id])
        .await
        .unwrap();
    assert_eq!(delivered, vec![message.id]);

    h.core
        .reads
        .mark_messages_as_read(chat.id, b, &[message.id])
        .await
        .unwrap();

    let delivered = h
        .core
        .messages
        .mark_delivered(chat.id, b, &[message.id])
        .await
        .unwrap();
    assert!(delivered.is_empty());

    let view = h.core.messages.get_message(chat.id, a, message.id).await.unwrap();
    assert_eq!(view.status, MessageStatus::Read);
    assert!(view.delivered_at.is_some());
    assert!(view.read_at.is_some());
}

#[tokio::test]
async fn test_read_without_delivery_sets_delivered_at() {
    let h = Harness::new();
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat = h.direct(a, b).await;
    let message = h.send(chat.id, a, "hi").await;

    h.core
        .reads
        .mark_messages_as_read(chat.id, b, &[message.id])
        .await
        .unwrap();

    let view = h.core.messages.get_message(chat.id, b, message.id).await.unwrap();
    assert_eq!(view.status, MessageStatus::Read);
    assert_eq!(view.delivered_at, view.read_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_last_message_converges_to_latest_accepted() {
    let h = Arc::new(Harness::with_moderation(Arc::new(DelayingModerator {
        marker: "slow",
        delay: Duration::from_millis(100),
    })));
    let a = h.user("Alice");
    let b = h.user("Bob");
    let chat_id = h.direct(a, b).await.id;

    let early = {
        let h = h.clone();
        tokio::spawn(async move { h.send(chat_id, a, "slow first").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let late = h.send(chat_id, b, "fast second").await;
    let early = early.await.unwrap();

    // The earlier-accepted message commits last but must not win.
    assert!(early.created_at < late.created_at);
    assert!(early.seq > late.seq);

    let summary = h.summary(a, chat_id).await;
    let last = summary.last_message.unwrap();
    assert_eq!(last.message_id, late.id);
    assert_eq!(last.timestamp, late.created_at);
    assert_eq!(last.preview, "fast second");
}
