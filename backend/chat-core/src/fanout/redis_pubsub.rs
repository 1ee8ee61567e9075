//! Redis pub/sub fanout
//!
//! Events are `PUBLISH`ed on their channel name (`chat:{id}` / `user:{id}`),
//! so any node can relay them to its locally connected subscribers.

use super::{Channel, ChatEvent, ConnectionRegistry, EventEnvelope, FanoutError, RealtimeFanout};
use crate::services::retry::{calculate_backoff, next_backoff, RetryConfig};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use std::future::Future;
use tokio::time::Instant;

#[derive(Clone)]
pub struct RedisFanout {
    client: Client,
    manager: ConnectionManager,
}

impl RedisFanout {
    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        tracing::info!("Redis fanout connected");
        Ok(Self { client, manager })
    }

    /// Forward every published event to this node's in-process subscribers.
    /// Returns when the pub/sub connection closes.
    #[allow(deprecated)]
    pub async fn relay_to(&self, registry: ConnectionRegistry) -> RedisResult<()> {
        // PubSub requires a dedicated connection, not multiplexed
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.psubscribe("chat:*").await?;
        pubsub.psubscribe("user:*").await?;
        tracing::info!("Redis fanout relay subscribed");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel_name: String = msg.get_channel_name().into();
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, channel = %channel_name, "Undecodable pub/sub payload");
                    continue;
                }
            };
            match channel_name.parse::<Channel>() {
                Ok(channel) => registry.broadcast(channel, payload),
                Err(e) => tracing::debug!(error = %e, "Ignoring message on unknown channel"),
            }
        }
        Ok(())
    }

    /// Keep relaying for the life of the process, reconnecting with backoff
    /// whenever the subscription ends or fails.
    pub async fn relay_forever(self, registry: ConnectionRegistry, retry: RetryConfig) {
        supervise(&retry, || self.relay_to(registry.clone())).await
    }
}

/// Run `relay` again after every exit. The backoff resets once a run has
/// stayed up for at least `max_backoff`.
async fn supervise<F, Fut>(retry: &RetryConfig, mut relay: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RedisResult<()>>,
{
    let mut backoff = retry.initial_backoff;
    loop {
        let started = Instant::now();
        match relay().await {
            Ok(()) => tracing::warn!("Redis relay stream ended; reconnecting"),
            Err(e) => tracing::error!(error = %e, "Redis relay failed; reconnecting"),
        }

        if started.elapsed() >= retry.max_backoff {
            backoff = retry.initial_backoff;
        }
        let delay = calculate_backoff(backoff, retry.jitter);
        tracing::debug!(delay = ?delay, "Waiting before relay reconnect");
        tokio::time::sleep(delay).await;
        backoff = next_backoff(backoff, retry);
    }
}

#[async_trait]
impl RealtimeFanout for RedisFanout {
    async fn publish(&self, channel: &Channel, event: &ChatEvent) -> Result<(), FanoutError> {
        let payload = EventEnvelope::new(channel, event.clone()).to_json()?;
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel.to_string(), payload)
            .await
            .map_err(|e| FanoutError::Transport(e.to_string()))
    }
}
