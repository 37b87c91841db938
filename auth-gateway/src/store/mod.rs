//! External whitelist store boundary
//!
//! The store holds one set enumerating the registered sources and one set per
//! source with its path specifications. Change notifications are only hints:
//! consumers always re-read current state after receiving one.

mod memory;
mod redis_store;

pub use self::memory::InMemoryWhitelistStore;
pub use self::redis_store::RedisWhitelistStore;

use crate::config::StoreConfig;
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Change hint delivered by a store subscription.
///
/// Delivery is at-least-once and unordered relative to writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WhitelistEvent {
    /// A source was added to or removed from the registry
    KeysChanged,
    /// The specification set of one source changed
    SourceChanged(String),
    /// Notifications may have been lost (e.g. after a reconnect)
    Resync,
}

/// Repository interface for the whitelist store
#[async_trait]
pub trait WhitelistStore: Send + Sync {
    /// Logical names of all registered sources
    async fn list_source_keys(&self) -> Result<HashSet<String>, StoreError>;

    /// Current specifications of one source; empty if the source is gone
    async fn list_url_specifications(&self, source: &str) -> Result<HashSet<String>, StoreError>;

    /// Start delivering change hints into `events` until the returned
    /// subscription is dropped or the receiver is closed
    async fn subscribe(&self, events: mpsc::Sender<WhitelistEvent>) -> Result<Subscription, StoreError>;
}

/// Live notification registration; dropping it stops delivery
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn with_task(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// A subscription whose lifetime is tied to the receiver only
    pub(crate) fn passive() -> Self {
        Self { task: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Key and channel naming of the whitelist store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    registry_key: String,
    source_key_prefix: String,
}

const KEYSPACE_CHANNEL_PREFIX: &str = "__keyspace@";
const KEYSPACE_CHANNEL_SEPARATOR: &str = "__:";

impl StoreLayout {
    pub fn new(registry_key: impl Into<String>, source_key_prefix: impl Into<String>) -> Self {
        Self {
            registry_key: registry_key.into(),
            source_key_prefix: source_key_prefix.into(),
        }
    }

    pub fn registry_key(&self) -> &str {
        &self.registry_key
    }

    /// Store key holding the specifications of `source`
    pub fn source_key(&self, source: &str) -> String {
        format!("{}{}", self.source_key_prefix, source)
    }

    /// Logical source name for a registry member; members may be stored
    /// either as bare names or as full keys
    pub fn source_name<'a>(&self, member: &'a str) -> &'a str {
        member
            .strip_prefix(self.source_key_prefix.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(member)
    }

    /// Map a notification channel to the event it signals
    pub fn classify(&self, channel: &str) -> Option<WhitelistEvent> {
        let key = match channel.strip_prefix(KEYSPACE_CHANNEL_PREFIX) {
            Some(rest) => rest.split_once(KEYSPACE_CHANNEL_SEPARATOR)?.1,
            None => channel,
        };

        if key == self.registry_key {
            return Some(WhitelistEvent::KeysChanged);
        }
        key.strip_prefix(self.source_key_prefix.as_str())
            .filter(|name| !name.is_empty())
            .map(|name| WhitelistEvent::SourceChanged(name.to_string()))
    }

    /// Exact channels to SUBSCRIBE to
    pub fn channels(&self) -> Vec<String> {
        vec![self.registry_key.clone()]
    }

    /// Glob channels to PSUBSCRIBE to
    pub fn channel_patterns(&self, keyspace_events: bool) -> Vec<String> {
        let source_pattern = format!("{}*", escape_glob(&self.source_key_prefix));
        let mut patterns = vec![source_pattern.clone()];
        if keyspace_events {
            patterns.push(format!("__keyspace@*__:{}", escape_glob(&self.registry_key)));
            patterns.push(format!("__keyspace@*__:{source_pattern}"));
        }
        patterns
    }
}

impl From<&StoreConfig> for StoreLayout {
    fn from(config: &StoreConfig) -> Self {
        Self::new(config.registry_key.clone(), config.source_key_prefix.clone())
    }
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

/// Escape Redis glob metacharacters
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
