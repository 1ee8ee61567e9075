// Shared harness for chat-core integration tests
//
// Wires a ChatCore over one in-memory store with an in-process fanout, a
// directory of registered users and a notifier that records requests.

#![allow(dead_code)]

use async_trait::async_trait;
use chat_core::error::AppResult;
use chat_core::fanout::{
    Channel, ChatEvent, ConnectionRegistry, EventEnvelope, FanoutError, RealtimeFanout,
};
use chat_core::models::{
    Chat, ChatSummary, ChatType, LastMessage, Message, MessageContent, PageAnchor,
    SendMessageRequest,
};
use chat_core::services::{
    AllowAllModerator, InMemoryDirectory, ModerationGateway, ModerationVerdict,
    NotificationGateway, NotificationRequest,
};
use chat_core::store::{ChatMutation, ChatStore, MemoryStore, MessageStore};
use chat_core::{ChatConfig, ChatCore, Collaborators, Stores};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

#[derive(Default)]
pub struct RecordingNotifier {
    pub requests: Mutex<Vec<NotificationRequest>>,
}

#[async_trait]
impl NotificationGateway for RecordingNotifier {
    async fn notify(&self, request: NotificationRequest) -> AppResult<()> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

impl RecordingNotifier {
    pub fn recipients(&self) -> Vec<Uuid> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.recipient_id)
            .collect()
    }
}

/// Holds back texts containing `marker` so later sends can overtake them
pub struct DelayingModerator {
    pub marker: &'static str,
    pub delay: Duration,
}

#[async_trait]
impl ModerationGateway for DelayingModerator {
    async fn moderate(&self, text: &str, _author_id: Uuid) -> AppResult<ModerationVerdict> {
        if text.contains(self.marker) {
            tokio::time::sleep(self.delay).await;
        }
        Ok(ModerationVerdict::approved())
    }
}

/// Chat store whose last-message cache writes land only after `delay`
pub struct SlowCacheWrites {
    pub inner: Arc<MemoryStore>,
    pub delay: Duration,
}

#[async_trait]
impl ChatStore for SlowCacheWrites {
    async fn insert_chat(&self, chat: Chat) -> AppResult<Chat> {
        self.inner.insert_chat(chat).await
    }

    async fn insert_direct_chat(&self, chat: Chat) -> AppResult<(Chat, bool)> {
        self.inner.insert_direct_chat(chat).await
    }

    async fn find_direct_chat(&self, user_a: Uuid, user_b: Uuid) -> AppResult<Option<Chat>> {
        self.inner.find_direct_chat(user_a, user_b).await
    }

    async fn get_chat(&self, chat_id: Uuid) -> AppResult<Option<Chat>> {
        self.inner.get_chat(chat_id).await
    }

    async fn chats_for_user(&self, user_id: Uuid) -> AppResult<Vec<Chat>> {
        self.inner.chats_for_user(user_id).await
    }

    async fn apply_mutation(&self, chat_id: Uuid, mutation: ChatMutation) -> AppResult<Chat> {
        self.inner.apply_mutation(chat_id, mutation).await
    }

    async fn update_last_message_if_newer(
        &self,
        chat_id: Uuid,
        candidate: LastMessage,
    ) -> AppResult<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .update_last_message_if_newer(chat_id, candidate)
            .await
    }

    async fn refresh_last_message_preview(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        preview: String,
    ) -> AppResult<bool> {
        self.inner
            .refresh_last_message_preview(chat_id, message_id, preview)
            .await
    }
}

/// Fanout whose transport is always down
pub struct FailingFanout;

#[async_trait]
impl RealtimeFanout for FailingFanout {
    async fn publish(&self, _channel: &Channel, _event: &ChatEvent) -> Result<(), FanoutError> {
        Err(FanoutError::Transport("connection refused".into()))
    }
}

pub struct Harness {
    pub core: ChatCore,
    pub store: Arc<MemoryStore>,
    pub registry: ConnectionRegistry,
    pub directory: Arc<InMemoryDirectory>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_moderation(Arc::new(AllowAllModerator))
    }

    pub fn with_moderation(moderation: Arc<dyn ModerationGateway>) -> Self {
        Self::custom(moderation, |store| store as Arc<dyn ChatStore>, None)
    }

    /// Full control over the wiring: `wrap_chats` decorates the chat store
    /// seam, and `fanout` replaces the in-process registry as publisher.
    pub fn custom(
        moderation: Arc<dyn ModerationGateway>,
        wrap_chats: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn ChatStore>,
        fanout: Option<Arc<dyn RealtimeFanout>>,
    ) -> Self {
        chat_core::logging::init_test_tracing();

        let store = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::new();
        let directory = Arc::new(InMemoryDirectory::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let stores = Stores {
            chats: wrap_chats(store.clone()),
            messages: store.clone(),
            unread: store.clone(),
        };
        let collaborators = Collaborators {
            directory: directory.clone(),
            moderation,
            notifier: notifier.clone(),
            fanout: fanout.unwrap_or_else(|| Arc::new(registry.clone())),
        };
        let core = ChatCore::new(ChatConfig::default(), stores, collaborators);

        Self {
            core,
            store,
            registry,
            directory,
            notifier,
        }
    }

    pub fn user(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.directory.register(id, name);
        id
    }

    pub async fn direct(&self, a: Uuid, b: Uuid) -> Chat {
        self.core
            .conversations
            .create_or_get_chat(a, &[a, b], ChatType::Direct)
            .await
            .unwrap()
    }

    pub async fn group(&self, creator: Uuid, members: &[Uuid]) -> Chat {
        self.core
            .conversations
            .create_or_get_chat(creator, members, ChatType::Group)
            .await
            .unwrap()
    }

    pub async fn send(&self, chat_id: Uuid, sender: Uuid, body: &str) -> Message {
        self.core
            .messages
            .send_message(chat_id, sender, SendMessageRequest::text(body))
            .await
            .unwrap()
    }

    pub async fn summary(&self, user: Uuid, chat_id: Uuid) -> ChatSummary {
        self.core
            .conversations
            .get_user_chats(user)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.chat_id == chat_id)
            .expect("chat missing from user's list")
    }

    pub async fn unread(&self, user: Uuid, chat_id: Uuid) -> u64 {
        self.summary(user, chat_id).await.unread_count
    }

    pub async fn subscribe(&self, channel: Channel) -> UnboundedReceiver<String> {
        self.registry.add_subscriber(channel).1
    }

    /// Polls the log until `sender` has a message in the chat; returns its id
    pub async fn wait_for_message(&self, chat_id: Uuid, sender: Uuid) -> Uuid {
        for _ in 0..200 {
            let (messages, _) = self
                .store
                .page(chat_id, sender, PageAnchor::Latest, 10)
                .await
                .unwrap();
            if let Some(message) = messages.iter().find(|m| m.sender_id == sender) {
                return message.id;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("no message from sender appeared");
    }

    /// Waits for background notification dispatch to settle
    pub async fn notifications(&self, expected: usize) -> Vec<NotificationRequest> {
        for _ in 0..50 {
            if self.notifier.requests.lock().unwrap().len() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.notifier.requests.lock().unwrap().clone()
    }
}

pub fn text_of(content: &Option<MessageContent>) -> Option<&str> {
    match content {
        Some(MessageContent::Text { body }) => Some(body.as_str()),
        _ => None,
    }
}

/// Event types received so far, in order
pub fn drain_event_types(rx: &mut UnboundedReceiver<String>) -> Vec<String> {
    let mut types = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        let envelope: EventEnvelope = serde_json::from_str(&payload).unwrap();
        types.push(envelope.event.event_type().to_string());
    }
    types
}
