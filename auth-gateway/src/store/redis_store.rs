use super::{StoreLayout, Subscription, WhitelistEvent, WhitelistStore};
use crate::config::StoreConfig;
use crate::error::StoreError;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

/// Redis-backed whitelist store.
///
/// Reads go through a shared [`ConnectionManager`] that is established on
/// first use, so the gateway can start while Redis is down. Notifications use
/// a dedicated pub/sub connection that is re-established after every drop.
pub struct RedisWhitelistStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    layout: StoreLayout,
    timeout: Duration,
    keyspace_events: bool,
    reconnect_delay: Duration,
}

impl RedisWhitelistStore {
    /// Create a store for the configured Redis URL. No connection is made yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Protocol`] if the URL cannot be parsed.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.redis_url.as_str())?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            layout: StoreLayout::from(config),
            timeout: config.timeout(),
            keyspace_events: config.keyspace_events,
            reconnect_delay: config.reconnect_delay(),
        })
    }

    /// Round-trip a PING through the shared connection
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = self.bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .bounded(
                self.connection
                    .get_or_try_init(|| ConnectionManager::new(self.client.clone())),
            )
            .await?;
        Ok(conn.clone())
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(
                u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }
}

#[async_trait]
impl WhitelistStore for RedisWhitelistStore {
    async fn list_source_keys(&self) -> Result<HashSet<String>, StoreError> {
        let mut conn = self.connection().await?;
        let members: HashSet<String> = self
            .bounded(conn.smembers(self.layout.registry_key()))
            .await?;

        Ok(members
            .iter()
            .map(|member| self.layout.source_name(member).to_string())
            .collect())
    }

    async fn list_url_specifications(&self, source: &str) -> Result<HashSet<String>, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.smembers(self.layout.source_key(source))).await
    }

    async fn subscribe(&self, events: mpsc::Sender<WhitelistEvent>) -> Result<Subscription, StoreError> {
        let listener = NotificationListener {
            client: self.client.clone(),
            layout: self.layout.clone(),
            keyspace_events: self.keyspace_events,
            reconnect_delay: self.reconnect_delay,
        };
        let task = tokio::spawn(listener.run(events));
        Ok(Subscription::with_task(task))
    }
}

/// Owns the pub/sub connection for one subscription
struct NotificationListener {
    client: redis::Client,
    layout: StoreLayout,
    keyspace_events: bool,
    reconnect_delay: Duration,
}

impl NotificationListener {
    async fn run(self, events: mpsc::Sender<WhitelistEvent>) {
        loop {
            match self.listen(&events).await {
                Ok(()) => {
                    debug!("Whitelist event receiver closed, stopping listener");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "Whitelist notification connection lost, reconnecting");
                }
            }
            if events.is_closed() {
                return;
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// Listen on one connection. `Ok` means the receiver went away.
    async fn listen(&self, events: &mpsc::Sender<WhitelistEvent>) -> Result<(), StoreError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        for channel in self.layout.channels() {
            pubsub.subscribe(channel).await?;
        }
        for pattern in self.layout.channel_patterns(self.keyspace_events) {
            pubsub.psubscribe(pattern).await?;
        }
        info!(
            registry_key = self.layout.registry_key(),
            keyspace_events = self.keyspace_events,
            "📡 Subscribed to whitelist notifications"
        );

        // Anything published while we were disconnected is lost
        if events.send(WhitelistEvent::Resync).await.is_err() {
            return Ok(());
        }

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let channel = msg.get_channel_name();
            let Some(event) = self.layout.classify(channel) else {
                debug!(channel, "Ignoring notification on unrelated channel");
                continue;
            };
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }

        Err(StoreError::Unavailable("notification stream ended".to_string()))
    }
}
