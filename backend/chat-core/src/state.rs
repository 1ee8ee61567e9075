use crate::config::{ChatConfig, FanoutConfig, StoreConfig};
use crate::error::AppResult;
use crate::fanout::redis_pubsub::RedisFanout;
use crate::fanout::{ConnectionRegistry, RealtimeFanout};
use crate::services::{
    AllowAllModerator, ConversationService, InMemoryDirectory, LoggingNotifier, MessageService,
    ModerationGateway, NotificationGateway, ReadService, RetryConfig, UnreadTracker,
    UserDirectory,
};
use crate::store::{ChatStore, MemoryStore, MessageStore, PgStore, UnreadStore};
use std::sync::Arc;

/// Storage backends. The three seams may share one implementation.
#[derive(Clone)]
pub struct Stores {
    pub chats: Arc<dyn ChatStore>,
    pub messages: Arc<dyn MessageStore>,
    pub unread: Arc<dyn UnreadStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            chats: store.clone(),
            messages: store.clone(),
            unread: store,
        }
    }

    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            chats: store.clone(),
            messages: store.clone(),
            unread: store,
        }
    }
}

/// External collaborators the core calls out to
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn UserDirectory>,
    pub moderation: Arc<dyn ModerationGateway>,
    pub notifier: Arc<dyn NotificationGateway>,
    pub fanout: Arc<dyn RealtimeFanout>,
}

impl Collaborators {
    /// Permissive defaults around a given directory and fanout
    pub fn local(directory: Arc<dyn UserDirectory>, fanout: Arc<dyn RealtimeFanout>) -> Self {
        Self {
            directory,
            moderation: Arc::new(AllowAllModerator),
            notifier: Arc::new(LoggingNotifier),
            fanout,
        }
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::local(
            Arc::new(InMemoryDirectory::new()),
            Arc::new(ConnectionRegistry::new()),
        )
    }
}

#[derive(Clone)]
pub struct ChatCore {
    pub config: Arc<ChatConfig>,
    pub conversations: Arc<ConversationService>,
    pub messages: Arc<MessageService>,
    pub reads: Arc<ReadService>,
}

impl ChatCore {
    pub fn new(config: ChatConfig, stores: Stores, collaborators: Collaborators) -> Self {
        let config = Arc::new(config);
        let unread = UnreadTracker::new(stores.unread.clone(), config.counter_retry.clone());

        let conversations = Arc::new(ConversationService::new(
            stores.chats.clone(),
            collaborators.directory.clone(),
            collaborators.notifier.clone(),
            collaborators.fanout.clone(),
            config.clone(),
        ));
        let messages = Arc::new(MessageService::new(
            stores.chats.clone(),
            stores.messages.clone(),
            unread.clone(),
            collaborators.moderation,
            collaborators.directory,
            collaborators.notifier,
            collaborators.fanout.clone(),
            config.clone(),
        ));
        let reads = Arc::new(ReadService::new(
            stores.chats,
            stores.messages,
            unread,
            collaborators.fanout,
        ));

        tracing::info!(
            max_group_size = config.max_group_size,
            max_page_size = config.max_page_size,
            "Chat core initialized"
        );
        Self {
            config,
            conversations,
            messages,
            reads,
        }
    }
}

/// Build the configured fanout. With Redis, events published by any node
/// are relayed to this node's `registry` by a background task.
pub async fn connect_fanout(
    config: &ChatConfig,
    registry: ConnectionRegistry,
) -> AppResult<Arc<dyn RealtimeFanout>> {
    match &config.fanout {
        FanoutConfig::InProcess => Ok(Arc::new(registry)),
        FanoutConfig::Redis { url } => {
            let fanout = RedisFanout::from_url(url).await?;
            tokio::spawn(fanout.clone().relay_forever(registry, RetryConfig::default()));
            Ok(Arc::new(fanout))
        }
    }
}

/// Build the configured stores. Postgres is migrated before use.
pub async fn connect_stores(config: &ChatConfig) -> AppResult<Stores> {
    match &config.store {
        StoreConfig::Memory => Ok(Stores::in_memory()),
        StoreConfig::Postgres {
            url,
            max_connections,
        } => {
            let store = PgStore::connect(url, *max_connections)?;
            store.run_migrations().await?;
            Ok(Stores::postgres(store))
        }
    }
}
