use super::{StoreLayout, Subscription, WhitelistEvent, WhitelistStore};
use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// In-memory whitelist store for testing and development.
///
/// Mirrors the Redis layout: a registry set plus one set per source, keyed
/// by full store key. Every mutation publishes the hint an operator would
/// publish after the equivalent store command.
pub struct InMemoryWhitelistStore {
    layout: StoreLayout,
    sets: DashMap<String, HashSet<String>>,
    subscribers: Mutex<Vec<mpsc::Sender<WhitelistEvent>>>,
    available: AtomicBool,
    notifications: AtomicBool,
}

impl InMemoryWhitelistStore {
    pub fn new() -> Self {
        Self::with_layout(StoreLayout::default())
    }

    pub fn with_layout(layout: StoreLayout) -> Self {
        Self {
            layout,
            sets: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            notifications: AtomicBool::new(true),
        }
    }

    /// Add a source to the registry
    pub fn register_source(&self, source: &str) {
        self.sets
            .entry(self.layout.registry_key().to_string())
            .or_default()
            .insert(source.to_string());
        self.publish(WhitelistEvent::KeysChanged);
    }

    /// Remove a source from the registry (its set is left in place)
    pub fn deregister_source(&self, source: &str) {
        if let Some(mut members) = self.sets.get_mut(self.layout.registry_key()) {
            members.remove(source);
        }
        self.publish(WhitelistEvent::KeysChanged);
    }

    pub fn add_specifications<I, S>(&self, source: &str, specs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sets
            .entry(self.layout.source_key(source))
            .or_default()
            .extend(specs.into_iter().map(Into::into));
        self.publish(WhitelistEvent::SourceChanged(source.to_string()));
    }

    pub fn remove_specifications<'a, I>(&self, source: &str, specs: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let key = self.layout.source_key(source);
        if let Some(mut set) = self.sets.get_mut(&key) {
            for spec in specs {
                set.remove(spec);
            }
        }
        // Redis drops a set once it is empty
        self.sets.remove_if(&key, |_, set| set.is_empty());
        self.publish(WhitelistEvent::SourceChanged(source.to_string()));
    }

    /// Delete a source's set entirely
    pub fn clear_source(&self, source: &str) {
        self.sets.remove(&self.layout.source_key(source));
        self.publish(WhitelistEvent::SourceChanged(source.to_string()));
    }

    /// Simulate the store being unreachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulate lost notifications; mutations still apply
    pub fn set_notifications(&self, enabled: bool) {
        self.notifications.store(enabled, Ordering::SeqCst);
    }

    /// Deliver a hint to every live subscriber
    pub fn publish(&self, event: WhitelistEvent) {
        if !self.notifications.load(Ordering::SeqCst) {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()))
        }
    }
}

impl Default for InMemoryWhitelistStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WhitelistStore for InMemoryWhitelistStore {
    async fn list_source_keys(&self) -> Result<HashSet<String>, StoreError> {
        self.ensure_available()?;
        Ok(self
            .sets
            .get(self.layout.registry_key())
            .map(|members| {
                members
                    .iter()
                    .map(|member| self.layout.source_name(member).to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_url_specifications(&self, source: &str) -> Result<HashSet<String>, StoreError> {
        self.ensure_available()?;
        Ok(self
            .sets
            .get(&self.layout.source_key(source))
            .map(|set| set.clone())
            .unwrap_or_default())
    }

    async fn subscribe(&self, events: mpsc::Sender<WhitelistEvent>) -> Result<Subscription, StoreError> {
        self.ensure_available()?;
        self.subscribers.lock().push(events);
        Ok(Subscription::passive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_round_trip() {
        let store = InMemoryWhitelistStore::new();
        store.register_source("svc-a");
        store.register_source("ignorable_urls:service:svc-b");
        store.add_specifications("svc-a", ["/a/**", "/a/health"]);

        let keys = store.list_source_keys().await.unwrap();
        assert_eq!(keys, HashSet::from(["svc-a".to_string(), "svc-b".to_string()]));

        let specs = store.list_url_specifications("svc-a").await.unwrap();
        assert_eq!(specs.len(), 2);

        store.remove_specifications("svc-a", ["/a/**", "/a/health"]);
        assert!(store.list_url_specifications("svc-a").await.unwrap().is_empty());
        assert!(store.list_url_specifications("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mutations_publish_hints() {
        let store = InMemoryWhitelistStore::new();
        let (tx, mut rx) = mpsc::channel(8);
        let _subscription = store.subscribe(tx).await.unwrap();

        store.register_source("svc-a");
        store.add_specifications("svc-a", ["/x"]);
        assert_eq!(rx.recv().await, Some(WhitelistEvent::KeysChanged));
        assert_eq!(rx.recv().await, Some(WhitelistEvent::SourceChanged("svc-a".to_string())));

        store.set_notifications(false);
        store.clear_source("svc-a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_calls() {
        let store = InMemoryWhitelistStore::new();
        store.set_available(false);
        assert!(matches!(store.list_source_keys().await, Err(StoreError::Unavailable(_))));
        assert!(store.list_url_specifications("svc-a").await.is_err());
        store.set_available(true);
        assert!(store.list_source_keys().await.is_ok());
    }
}
