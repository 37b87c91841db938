//! Dynamic whitelist synchronization
//!
//! [`WhitelistSynchronizer`] mirrors every source's specification set from the
//! store, merges them with the static baseline, and publishes an immutable
//! [`Ruleset`] through an atomic pointer swap. Request tasks only ever load
//! the published pointer; they never wait on a refresh or a merge.
//!
//! Refreshes are driven by store notifications (coalesced over a short
//! window) and by a periodic backstop that heals missed notifications.

use crate::config::GatewayConfig;
use crate::error::{CompileError, StoreError};
use crate::pattern::{compile, PathPattern};
use crate::ruleset::Ruleset;
use crate::store::{Subscription, WhitelistEvent, WhitelistStore};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 256;

/// Read access to the currently published ruleset
pub trait RulesetSource: Send + Sync {
    /// Latest published ruleset; never blocks
    fn current_ruleset(&self) -> Arc<Ruleset>;
}

/// Synchronizer tuning
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Static specifications that are always whitelisted
    pub baseline: Vec<String>,

    /// Backstop full refresh interval
    pub refresh_interval: Duration,

    /// Window over which notifications are coalesced
    pub debounce: Duration,

    /// Bound on each store call made by a refresh
    pub store_timeout: Duration,
}

impl SyncOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            baseline: config.whitelist.static_urls.clone(),
            refresh_interval: config.whitelist.refresh_interval(),
            debounce: config.whitelist.notification_debounce(),
            store_timeout: config.store.timeout(),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            baseline: Vec::new(),
            refresh_interval: Duration::from_secs(60),
            debounce: Duration::from_millis(50),
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// Lifecycle of the synchronizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No full refresh has succeeded yet; only the baseline is published
    Uninitialized,
    /// At least one full refresh has succeeded
    Synchronized,
}

/// Point-in-time view of the synchronizer
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub generation: u64,
    pub patterns: usize,
    pub sources: usize,
    pub last_success: Option<DateTime<Utc>>,
}

/// Compiled specifications keyed by their source text. Failures are kept
/// too so a malformed specification is reported once.
#[derive(Default)]
struct PatternCache {
    entries: HashMap<String, std::result::Result<Arc<PathPattern>, CompileError>>,
    generation: u64,
}

/// Keeps the published whitelist in step with the external store
pub struct WhitelistSynchronizer {
    store: Arc<dyn WhitelistStore>,
    options: SyncOptions,

    /// Last successfully read specification set per source
    sources: DashMap<String, HashSet<String>>,

    /// Serialises concurrent refreshes of the same source
    refresh_gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,

    /// Also serialises merges so generations are published in order
    cache: Mutex<PatternCache>,

    current: ArcSwap<Ruleset>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl WhitelistSynchronizer {
    /// Create a synchronizer and publish the baseline-only ruleset.
    ///
    /// No store I/O happens until [`refresh_all`](Self::refresh_all) or
    /// [`start`](Self::start).
    pub fn new(store: Arc<dyn WhitelistStore>, options: SyncOptions) -> Self {
        let sync = Self {
            store,
            options,
            sources: DashMap::new(),
            refresh_gates: DashMap::new(),
            cache: Mutex::new(PatternCache::default()),
            current: ArcSwap::from_pointee(Ruleset::empty()),
            last_success: Mutex::new(None),
        };
        sync.merge();
        sync
    }

    // =============================================================================
    // Refresh Operations
    // =============================================================================

    /// Re-read the registry and every registered source, then merge.
    ///
    /// Sources no longer listed in the registry are dropped. A source whose
    /// read fails keeps its previous entry.
    ///
    /// # Errors
    ///
    /// Returns the listing error without merging if the registry cannot be
    /// read, otherwise the first per-source error after merging.
    pub async fn refresh_all(&self) -> std::result::Result<Arc<Ruleset>, StoreError> {
        let keys = match self.bounded(self.store.list_source_keys()).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "Failed to list whitelist sources, keeping current ruleset");
                record_refresh("error");
                return Err(err);
            }
        };

        let results = join_all(keys.iter().map(|key| self.refresh_source(key))).await;

        self.sources.retain(|key, _| {
            let registered = keys.contains(key);
            if !registered {
                info!(source = %key, "Whitelist source deregistered");
            }
            registered
        });
        // A gate still held by an in-flight refresh stays until it is released
        self.refresh_gates
            .retain(|key, gate| keys.contains(key) || Arc::strong_count(gate) > 1);

        let ruleset = self.merge();

        match results.into_iter().find_map(std::result::Result::err) {
            None => {
                *self.last_success.lock() = Some(Utc::now());
                record_refresh("success");
                info!(
                    sources = keys.len(),
                    patterns = ruleset.len(),
                    generation = ruleset.generation(),
                    "✅ Whitelist synchronized"
                );
                Ok(ruleset)
            }
            Some(err) => {
                record_refresh("partial");
                Err(err)
            }
        }
    }

    /// Re-read one source's specifications and replace its entry.
    ///
    /// An empty set removes the entry. Does not merge.
    ///
    /// # Errors
    ///
    /// Returns the store error; the previous entry is kept.
    pub async fn refresh_source(&self, source: &str) -> std::result::Result<(), StoreError> {
        let gate = self
            .refresh_gates
            .entry(source.to_string())
            .or_default()
            .clone();
        let _guard = gate.lock().await;

        let specs = match self.bounded(self.store.list_url_specifications(source)).await {
            Ok(specs) => specs,
            Err(err) => {
                warn!(source, error = %err, "Failed to read whitelist source, keeping previous entry");
                return Err(err);
            }
        };

        if specs.is_empty() {
            if self.sources.remove(source).is_some() {
                info!(source, "Whitelist source emptied");
            }
        } else {
            debug!(source, specs = specs.len(), "Whitelist source refreshed");
            self.sources.insert(source.to_string(), specs);
        }
        Ok(())
    }

    /// Refresh one source and publish the result
    ///
    /// # Errors
    ///
    /// Returns the store error; nothing is published in that case.
    pub async fn refresh_one(&self, source: &str) -> std::result::Result<Arc<Ruleset>, StoreError> {
        self.refresh_source(source).await?;
        Ok(self.merge())
    }

    /// Union baseline and sources, compile what is new, forget what is gone,
    /// and atomically publish the result.
    pub fn merge(&self) -> Arc<Ruleset> {
        let mut cache = self.cache.lock();

        let mut wanted: HashSet<String> = self.options.baseline.iter().cloned().collect();
        for entry in &self.sources {
            wanted.extend(entry.value().iter().cloned());
        }

        cache.entries.retain(|spec, _| wanted.contains(spec));

        let mut patterns = Vec::with_capacity(wanted.len());
        for spec in wanted {
            let compiled = cache.entries.entry(spec).or_insert_with_key(|spec| {
                let compiled = compile(spec).map(Arc::new);
                if let Err(ref err) = compiled {
                    warn!(spec = %err.spec, reason = %err.reason, "Skipping invalid whitelist specification");
                }
                compiled
            });
            if let Ok(pattern) = compiled {
                patterns.push(Arc::clone(pattern));
            }
        }

        cache.generation += 1;
        let ruleset = Arc::new(Ruleset::new(patterns, cache.generation));
        self.current.store(Arc::clone(&ruleset));

        #[allow(clippy::cast_precision_loss)]
        let pattern_count = ruleset.len() as f64;
        metrics::gauge!("gateway_whitelist_patterns").set(pattern_count);
        debug!(patterns = ruleset.len(), generation = ruleset.generation(), "Published whitelist ruleset");

        ruleset
    }

    /// Non-blocking read of the latest published ruleset
    pub fn current_ruleset(&self) -> Arc<Ruleset> {
        self.current.load_full()
    }

    pub fn status(&self) -> SyncStatus {
        let ruleset = self.current.load();
        let last_success = *self.last_success.lock();
        SyncStatus {
            state: if last_success.is_some() {
                SyncState::Synchronized
            } else {
                SyncState::Uninitialized
            },
            generation: ruleset.generation(),
            patterns: ruleset.len(),
            sources: self.sources.len(),
            last_success,
        }
    }

    /// Specifications currently held for `source`, if any
    pub fn source_specifications(&self, source: &str) -> Option<HashSet<String>> {
        self.sources.get(source).map(|entry| entry.value().clone())
    }

    async fn bounded<T, F>(&self, call: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        tokio::time::timeout(self.options.store_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Timeout(
                    u64::try_from(self.options.store_timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            })
    }

    // =============================================================================
    // Background Tasks
    // =============================================================================

    /// Subscribe to change notifications, run the initial full refresh, and
    /// spawn the notification listener and backstop timer.
    ///
    /// Never fails: if the store is unreachable the baseline stays published
    /// and the backstop keeps retrying.
    pub async fn start(self: &Arc<Self>) -> SyncHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let subscription = match self.store.subscribe(tx).await {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                error!(error = %err, "Failed to subscribe to whitelist notifications, relying on periodic refresh");
                None
            }
        };

        if let Err(err) = self.refresh_all().await {
            warn!(error = %err, "Initial whitelist refresh incomplete");
        }

        let listener = tokio::spawn(Arc::clone(self).listen(rx));
        let backstop = tokio::spawn(Arc::clone(self).backstop());

        info!(
            refresh_interval_secs = self.options.refresh_interval.as_secs(),
            subscribed = subscription.is_some(),
            "🔄 Whitelist synchronizer started"
        );

        SyncHandle {
            subscription,
            tasks: vec![listener, backstop],
        }
    }

    async fn listen(self: Arc<Self>, mut rx: mpsc::Receiver<WhitelistEvent>) {
        while let Some(first) = rx.recv().await {
            if !self.options.debounce.is_zero() {
                tokio::time::sleep(self.options.debounce).await;
            }

            let mut batch = vec![first];
            while let Ok(event) = rx.try_recv() {
                batch.push(event);
            }

            match coalesce(batch) {
                Coalesced::Full => {
                    let _ = self.refresh_all().await;
                }
                Coalesced::Sources(sources) => {
                    debug!(sources = sources.len(), "Refreshing notified whitelist sources");
                    join_all(sources.iter().map(|source| self.refresh_source(source))).await;
                    self.merge();
                }
            }
        }
        debug!("Whitelist notification channel closed");
    }

    async fn backstop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.options.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; start() already refreshed
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!("Periodic whitelist refresh");
            let _ = self.refresh_all().await;
        }
    }
}

impl RulesetSource for WhitelistSynchronizer {
    fn current_ruleset(&self) -> Arc<Ruleset> {
        WhitelistSynchronizer::current_ruleset(self)
    }
}

/// Background sync tasks; dropping the handle stops them
pub struct SyncHandle {
    subscription: Option<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.subscription.take();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Coalesced {
    Full,
    Sources(Vec<String>),
}

fn coalesce(batch: Vec<WhitelistEvent>) -> Coalesced {
    let mut sources = Vec::new();
    for event in batch {
        match event {
            WhitelistEvent::KeysChanged | WhitelistEvent::Resync => return Coalesced::Full,
            WhitelistEvent::SourceChanged(source) => {
                if !sources.contains(&source) {
                    sources.push(source);
                }
            }
        }
    }
    Coalesced::Sources(sources)
}

fn record_refresh(result: &'static str) {
    metrics::counter!("gateway_whitelist_refresh_total", "result" => result).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Matcher;
    use crate::store::InMemoryWhitelistStore;

    fn synchronizer(store: &Arc<InMemoryWhitelistStore>, baseline: &[&str]) -> WhitelistSynchronizer {
        let options = SyncOptions {
            baseline: baseline.iter().map(ToString::to_string).collect(),
            ..SyncOptions::default()
        };
        WhitelistSynchronizer::new(Arc::clone(store) as Arc<dyn WhitelistStore>, options)
    }

    #[test]
    fn test_baseline_published_at_construction() {
        let store = Arc::new(InMemoryWhitelistStore::new());
        let sync = synchronizer(&store, &["/health"]);
        let rules = sync.current_ruleset();
        assert!(rules.matches("/health"));
        assert_eq!(rules.generation(), 1);
        assert_eq!(sync.status().state, SyncState::Uninitialized);
    }

    #[tokio::test]
    async fn test_refresh_all_marks_synchronized() {
        let store = Arc::new(InMemoryWhitelistStore::new());
        store.register_source("svc-a");
        store.add_specifications("svc-a", ["/a/**"]);

        let sync = synchronizer(&store, &[]);
        let rules = sync.refresh_all().await.unwrap();
        assert!(rules.matches("/a/b/c"));

        let status = sync.status();
        assert_eq!(status.state, SyncState::Synchronized);
        assert_eq!(status.sources, 1);
        assert!(status.last_success.is_some());
    }

    #[tokio::test]
    async fn test_unregistered_source_is_pruned() {
        let store = Arc::new(InMemoryWhitelistStore::new());
        store.register_source("svc-a");
        store.add_specifications("svc-a", ["/a"]);
        let sync = synchronizer(&store, &[]);
        sync.refresh_all().await.unwrap();
        assert!(sync.current_ruleset().matches("/a"));

        store.deregister_source("svc-a");
        let rules = sync.refresh_all().await.unwrap();
        assert!(!rules.matches("/a"));
        assert!(sync.source_specifications("svc-a").is_none());
    }

    #[tokio::test]
    async fn test_failed_source_read_keeps_previous_entry() {
        let store = Arc::new(InMemoryWhitelistStore::new());
        store.register_source("svc-a");
        store.add_specifications("svc-a", ["/a"]);
        let sync = synchronizer(&store, &[]);
        sync.refresh_all().await.unwrap();

        store.set_available(false);
        assert!(sync.refresh_one("svc-a").await.is_err());
        assert!(sync.refresh_all().await.is_err());
        assert!(sync.current_ruleset().matches("/a"));
    }

    #[tokio::test]
    async fn test_busy_gate_of_unregistered_source_survives_pruning() {
        let store = Arc::new(InMemoryWhitelistStore::new());
        let sync = synchronizer(&store, &[]);

        let gate = sync
            .refresh_gates
            .entry("ghost".to_string())
            .or_default()
            .clone();
        let guard = gate.lock().await;

        sync.refresh_all().await.unwrap();
        let kept = sync.refresh_gates.get("ghost").map(|entry| Arc::clone(entry.value()));
        assert!(kept.is_some_and(|kept| Arc::ptr_eq(&kept, &gate)));

        drop(guard);
        drop(gate);
        sync.refresh_all().await.unwrap();
        assert!(sync.refresh_gates.get("ghost").is_none());
    }

    #[test]
    fn test_merge_is_idempotent_and_bumps_generation() {
        let store = Arc::new(InMemoryWhitelistStore::new());
        let sync = synchronizer(&store, &["/x", "/y/*"]);
        let first = sync.merge();
        let second = sync.merge();
        assert_eq!(
            first.specifications().collect::<Vec<_>>(),
            second.specifications().collect::<Vec<_>>()
        );
        assert!(second.generation() > first.generation());
    }

    #[test]
    fn test_compiled_patterns_are_reused_and_evicted() {
        let store = Arc::new(InMemoryWhitelistStore::new());
        let sync = synchronizer(&store, &["/x"]);
        sync.sources.insert("svc".to_string(), HashSet::from(["/y".to_string(), "bad".to_string()]));

        let first = sync.merge();
        let second = sync.merge();
        let find = |rules: &Ruleset| rules.find_match("/y").map(|p| p as *const PathPattern);
        assert_eq!(find(&first), find(&second));
        assert_eq!(sync.cache.lock().entries.len(), 3);

        sync.sources.remove("svc");
        sync.merge();
        let cache = sync.cache.lock();
        assert_eq!(cache.entries.len(), 1);
        assert!(cache.entries.contains_key("/x"));
    }

    #[test]
    fn test_coalesce_collapses_batches() {
        assert_eq!(
            coalesce(vec![
                WhitelistEvent::SourceChanged("a".to_string()),
                WhitelistEvent::SourceChanged("b".to_string()),
                WhitelistEvent::SourceChanged("a".to_string()),
            ]),
            Coalesced::Sources(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            coalesce(vec![
                WhitelistEvent::SourceChanged("a".to_string()),
                WhitelistEvent::Resync,
            ]),
            Coalesced::Full
        );
        assert_eq!(coalesce(vec![WhitelistEvent::KeysChanged]), Coalesced::Full);
    }
}
