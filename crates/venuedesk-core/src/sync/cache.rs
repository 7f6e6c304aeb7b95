//! In-memory query cache with sequence-guarded fetches.
//!
//! Entries are keyed by [`QueryKey`] and hold the last good value as JSON.
//! Every fetch issued for a key takes a new sequence number; a completed
//! response only lands if its number is still the entry's current one, so
//! the most recently *issued* request wins regardless of completion order.
//!
//! Consumers attach with [`QueryCache::subscribe`] and receive every change of
//! the entry through the returned [`Subscription`]. Dropping the last
//! subscription removes the entry.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{classify, ErrorRecord, RawFailure};
use crate::config::SyncConfig;

use super::key::QueryKey;

/// A repeatable fetch for one key. The cache keeps the last loader it saw so
/// invalidation can refetch without the caller.
pub type Loader = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, RawFailure>> + Send + Sync>;

/// Wrap a typed async fetch into a [`Loader`].
pub fn loader<F, Fut, T>(fetch: F) -> Loader
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RawFailure>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    Arc::new(move || {
        let pending = fetch();
        async move {
            let data = pending.await?;
            serde_json::to_value(data).map_err(RawFailure::decode)
        }
        .boxed()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
    Stale,
}

/// Snapshot of one cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub data: Option<Value>,
    pub status: QueryStatus,
    pub fetch_seq: u64,
    pub is_fetching: bool,
    pub stale_after: Option<Instant>,
    pub updated_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorRecord>,
}

impl CacheEntry {
    /// Entry for a key that has never been loaded.
    pub fn idle(key: QueryKey) -> Self {
        Self {
            key,
            data: None,
            status: QueryStatus::Idle,
            fetch_seq: 0,
            is_fetching: false,
            stale_after: None,
            updated_at: None,
            error: None,
        }
    }

    /// Successful and inside its stale time.
    pub fn is_fresh(&self) -> bool {
        self.status == QueryStatus::Success
            && self.stale_after.is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Decode the cached value. `None` when nothing has been loaded yet.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.data.clone().map(serde_json::from_value)
    }

    pub fn age_display(&self) -> String {
        let Some(updated_at) = self.updated_at else {
            return "never".to_string();
        };
        let minutes = (Utc::now() - updated_at).num_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }
}

struct Slot {
    id: u64,
    entry: CacheEntry,
    subscribers: usize,
    loader: Option<Loader>,
    /// Sequence number of the fetch the last invalidation issued.
    refetch_seq: Option<u64>,
    /// Invalidated again while that refetch was still running.
    reinvalidated: bool,
    tx: watch::Sender<CacheEntry>,
}

impl Slot {
    fn new(id: u64, key: QueryKey) -> Self {
        let entry = CacheEntry::idle(key);
        let (tx, _) = watch::channel(entry.clone());
        Self {
            id,
            entry,
            subscribers: 0,
            loader: None,
            refetch_seq: None,
            reinvalidated: false,
            tx,
        }
    }

    fn issue(&mut self, seq: u64, loader: Loader) {
        self.entry.fetch_seq = seq;
        self.entry.is_fetching = true;
        if self.entry.status != QueryStatus::Stale {
            self.entry.status = QueryStatus::Loading;
        }
        self.loader = Some(loader);
        self.reinvalidated = false;
    }

    fn publish(&self) {
        self.tx.send_replace(self.entry.clone());
    }
}

#[derive(Default)]
struct Store {
    slots: HashMap<QueryKey, Slot>,
    next_slot_id: u64,
}

impl Store {
    fn slot_mut(&mut self, key: &QueryKey) -> &mut Slot {
        let next_id = &mut self.next_slot_id;
        self.slots.entry(key.clone()).or_insert_with(|| {
            *next_id += 1;
            Slot::new(*next_id, key.clone())
        })
    }
}

struct Inner {
    store: Mutex<Store>,
    next_seq: AtomicU64,
    config: SyncConfig,
}

/// Process-wide result cache. Clone is cheap; clones share one store.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl QueryCache {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(Store::default()),
                next_seq: AtomicU64::new(0),
                config,
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.inner.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn len(&self) -> usize {
        self.store().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach to `key`, creating the entry if needed.
    pub fn subscribe(&self, key: &QueryKey) -> Subscription {
        let mut store = self.store();
        let slot = store.slot_mut(key);
        slot.subscribers += 1;
        debug!(key = %key, subscribers = slot.subscribers, "Subscribed");
        Subscription {
            cache: self.clone(),
            key: key.clone(),
            slot_id: slot.id,
            rx: slot.tx.subscribe(),
        }
    }

    fn detach(&self, key: &QueryKey, slot_id: u64) {
        let removed = {
            let mut store = self.store();
            let Some(slot) = store.slots.get_mut(key) else {
                return;
            };
            if slot.id != slot_id {
                return;
            }
            slot.subscribers = slot.subscribers.saturating_sub(1);
            if slot.subscribers == 0 {
                store.slots.remove(key)
            } else {
                None
            }
        };
        if removed.is_some() {
            debug!(key = %key, "Last subscriber detached, entry removed");
        }
    }

    /// Current state of `key`; an idle entry when nothing is cached.
    pub fn snapshot(&self, key: &QueryKey) -> CacheEntry {
        self.store()
            .slots
            .get(key)
            .map(|slot| slot.entry.clone())
            .unwrap_or_else(|| CacheEntry::idle(key.clone()))
    }

    /// Load `key`, reusing the cached value while it is fresh.
    pub async fn fetch(&self, key: &QueryKey, loader: Loader) -> Result<Value, ErrorRecord> {
        if let Some(data) = self.fresh_data(key) {
            debug!(key = %key, "Serving fresh cached value");
            return Ok(data);
        }
        self.run(key, loader).await
    }

    /// Load `key` even if the cached value is fresh.
    pub async fn refetch(&self, key: &QueryKey, loader: Loader) -> Result<Value, ErrorRecord> {
        self.run(key, loader).await
    }

    /// Issue a forced fetch in the background and return its sequence number.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_fetch(&self, key: &QueryKey, loader: Loader) -> u64 {
        let seq = self.issue(key, loader.clone());
        self.spawn_completion(key.clone(), seq, loader);
        seq
    }

    async fn run(&self, key: &QueryKey, loader: Loader) -> Result<Value, ErrorRecord> {
        let seq = self.issue(key, loader.clone());
        let result = loader().await;
        self.complete(key, seq, result)
    }

    fn fresh_data(&self, key: &QueryKey) -> Option<Value> {
        let store = self.store();
        let slot = store.slots.get(key)?;
        if slot.entry.is_fresh() {
            slot.entry.data.clone()
        } else {
            None
        }
    }

    fn issue(&self, key: &QueryKey, loader: Loader) -> u64 {
        let mut store = self.store();
        let seq = self.next_seq();
        let slot = store.slot_mut(key);
        slot.issue(seq, loader);
        slot.publish();
        debug!(key = %key, seq, "Issued fetch");
        seq
    }

    fn spawn_completion(&self, key: QueryKey, seq: u64, loader: Loader) {
        let cache = self.clone();
        tokio::spawn(async move {
            let result = loader().await;
            let _ = cache.complete(&key, seq, result);
        });
    }

    /// Apply a finished fetch if it is still the latest one issued for `key`.
    /// The caller always gets its own result back.
    fn complete(
        &self,
        key: &QueryKey,
        seq: u64,
        result: Result<Value, RawFailure>,
    ) -> Result<Value, ErrorRecord> {
        let result =
            result.map_err(|raw| classify(&raw, &self.inner.config.default_error_message));

        let mut store = self.store();
        let Some(slot) = store.slots.get_mut(key) else {
            debug!(key = %key, seq, "Entry gone, discarding response");
            return result;
        };
        if slot.entry.fetch_seq != seq {
            debug!(
                key = %key,
                seq,
                current = slot.entry.fetch_seq,
                "Discarding superseded response"
            );
            return result;
        }

        let reinvalidated = std::mem::take(&mut slot.reinvalidated);
        let entry = &mut slot.entry;
        match &result {
            Ok(data) => {
                entry.data = Some(data.clone());
                entry.error = None;
                entry.updated_at = Some(Utc::now());
                if reinvalidated {
                    // The data may predate the later write
                    entry.status = QueryStatus::Stale;
                    entry.stale_after = None;
                } else {
                    entry.status = QueryStatus::Success;
                    entry.stale_after = Some(Instant::now() + self.inner.config.stale_time);
                }
            }
            Err(error) => {
                warn!(key = %key, kind = %error.kind, message = %error.message, "Fetch failed");
                entry.status = QueryStatus::Error;
                entry.error = Some(error.clone());
            }
        }
        entry.is_fetching = false;
        slot.publish();
        if slot.subscribers == 0 {
            store.slots.remove(key);
            debug!(key = %key, "No subscribers, entry removed after fetch");
        }
        result
    }

    /// Mark `key` stale, keeping its data. With at least one subscriber the
    /// last loader is re-run right away. Returns whether a refetch was issued.
    ///
    /// An entry that was never loaded is left idle. A second invalidation
    /// while the refetch runs issues nothing new, but the refetch result then
    /// lands as stale instead of fresh.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        let refetch = {
            let mut store = self.store();
            let Some(slot) = store.slots.get_mut(key) else {
                return false;
            };
            if slot.entry.status == QueryStatus::Idle && slot.entry.data.is_none() {
                return false;
            }
            let refetch_in_flight =
                slot.entry.is_fetching && slot.refetch_seq == Some(slot.entry.fetch_seq);
            if refetch_in_flight {
                slot.reinvalidated = true;
            }
            slot.entry.status = QueryStatus::Stale;
            slot.entry.stale_after = None;

            let loader = if slot.subscribers > 0 && !refetch_in_flight {
                slot.loader.clone()
            } else {
                None
            };
            let refetch = loader.map(|loader| {
                let seq = self.next_seq();
                slot.issue(seq, loader.clone());
                slot.refetch_seq = Some(seq);
                (seq, loader)
            });
            slot.publish();
            refetch
        };

        match refetch {
            Some((seq, loader)) => {
                debug!(key = %key, seq, "Invalidated, refetching");
                self.spawn_completion(key.clone(), seq, loader);
                true
            }
            None => {
                debug!(key = %key, "Invalidated");
                false
            }
        }
    }

    /// Invalidate every live key `pattern` covers. Returns how many matched.
    pub fn invalidate_matching(&self, pattern: &QueryKey) -> usize {
        let keys: Vec<QueryKey> = self
            .store()
            .slots
            .keys()
            .filter(|key| key.starts_with(pattern))
            .cloned()
            .collect();
        for key in &keys {
            self.invalidate(key);
        }
        keys.len()
    }

    /// Drop every entry. Outstanding subscriptions see their stream end.
    pub fn clear(&self) {
        let slots = std::mem::take(&mut self.store().slots);
        info!(entries = slots.len(), "Cleared query cache");
        drop(slots);
    }
}

/// Live attachment to one cache entry. Dropping it detaches.
pub struct Subscription {
    cache: QueryCache,
    key: QueryKey,
    slot_id: u64,
    rx: watch::Receiver<CacheEntry>,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn current(&self) -> CacheEntry {
        self.rx.borrow().clone()
    }

    /// Wait for the next change. `None` once the cache has been cleared.
    pub async fn changed(&mut self) -> Option<CacheEntry> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the entry satisfies `condition`.
    pub async fn wait_for(
        &mut self,
        condition: impl FnMut(&CacheEntry) -> bool,
    ) -> Option<CacheEntry> {
        self.rx.wait_for(condition).await.ok().map(|entry| entry.clone())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cache.detach(&self.key, self.slot_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tokio::sync::oneshot;

    use crate::api::ErrorKind;

    fn key() -> QueryKey {
        QueryKey::new("venues").with("list").with("org-1").with("")
    }

    /// Loader that resolves once the test sends a value.
    fn gated(rx: oneshot::Receiver<Value>) -> Loader {
        let rx = Arc::new(Mutex::new(Some(rx)));
        Arc::new(move || {
            let rx = rx.lock().unwrap().take();
            async move {
                match rx {
                    Some(rx) => rx.await.map_err(RawFailure::no_response),
                    None => Err(RawFailure::no_response("loader reused")),
                }
            }
            .boxed()
        })
    }

    fn counting(calls: Arc<AtomicUsize>, value: Value) -> Loader {
        loader(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            async move { Ok::<_, RawFailure>(value) }
        })
    }

    fn failing(status: u16) -> Loader {
        loader(move || async move {
            Err::<Value, _>(RawFailure::from_response(status, ""))
        })
    }

    #[tokio::test]
    async fn test_latest_issued_fetch_wins() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let _sub = cache.subscribe(&key);
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();

        let first = cache.fetch(&key, gated(rx1));
        let second = cache.fetch(&key, gated(rx2));
        tokio::pin!(first);
        tokio::pin!(second);
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert!(futures::poll!(second.as_mut()).is_pending());

        tx2.send(json!("second")).unwrap();
        assert_eq!(second.await, Ok(json!("second")));
        tx1.send(json!("first")).unwrap();
        // The slow caller still gets its own response back
        assert_eq!(first.await, Ok(json!("first")));

        let entry = cache.snapshot(&key);
        assert_eq!(entry.data, Some(json!("second")));
        assert_eq!(entry.status, QueryStatus::Success);
        assert!(!entry.is_fetching);
    }

    #[tokio::test]
    async fn test_superseded_failure_does_not_mark_error() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let _sub = cache.subscribe(&key);
        let (tx1, rx1) = oneshot::channel::<Value>();
        let (tx2, rx2) = oneshot::channel();

        let first = cache.fetch(&key, gated(rx1));
        tokio::pin!(first);
        assert!(futures::poll!(first.as_mut()).is_pending());
        let second = cache.fetch(&key, gated(rx2));
        tokio::pin!(second);
        assert!(futures::poll!(second.as_mut()).is_pending());

        tx2.send(json!([1, 2])).unwrap();
        second.await.unwrap();
        drop(tx1);
        assert_eq!(first.await.unwrap_err().kind, ErrorKind::NetworkError);

        let entry = cache.snapshot(&key);
        assert_eq!(entry.status, QueryStatus::Success);
        assert!(entry.error.is_none());
    }

    #[tokio::test]
    async fn test_fresh_value_skips_loader() {
        let cache = QueryCache::new(SyncConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = key();
        let _sub = cache.subscribe(&key);

        cache.fetch(&key, counting(calls.clone(), json!(1))).await.unwrap();
        let cached = cache.fetch(&key, counting(calls.clone(), json!(2))).await.unwrap();
        assert_eq!(cached, json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let forced = cache.refetch(&key, counting(calls.clone(), json!(2))).await.unwrap();
        assert_eq!(forced, json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_stale_time_always_refetches() {
        let config = SyncConfig {
            stale_time: std::time::Duration::ZERO,
            ..SyncConfig::default()
        };
        let cache = QueryCache::new(config);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = key();
        let _sub = cache.subscribe(&key);

        cache.fetch(&key, counting(calls.clone(), json!(1))).await.unwrap();
        cache.fetch(&key, counting(calls.clone(), json!(1))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_data() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let _sub = cache.subscribe(&key);
        let calls = Arc::new(AtomicUsize::new(0));

        cache.fetch(&key, counting(calls, json!({"name": "Hall"}))).await.unwrap();
        let err = cache.refetch(&key, failing(503)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerError);
        assert_eq!(err.message, SyncConfig::default().default_error_message);

        let entry = cache.snapshot(&key);
        assert_eq!(entry.status, QueryStatus::Error);
        assert_eq!(entry.data, Some(json!({"name": "Hall"})));
        assert_eq!(entry.error.map(|e| e.http_status), Some(Some(503)));
    }

    #[tokio::test]
    async fn test_invalidate_keeps_data_and_refetches() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut sub = cache.subscribe(&key);

        cache.fetch(&key, counting(calls.clone(), json!("v"))).await.unwrap();
        assert!(cache.invalidate(&key));

        let entry = cache.snapshot(&key);
        assert_eq!(entry.status, QueryStatus::Stale);
        assert_eq!(entry.data, Some(json!("v")));
        assert!(entry.is_fetching);

        let settled = sub
            .wait_for(|e| e.status == QueryStatus::Success && !e.is_fetching)
            .await
            .expect("cache alive");
        assert_eq!(settled.data, Some(json!("v")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_without_subscriber_only_marks_stale() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let (tx, rx) = oneshot::channel();

        let pending = cache.fetch(&key, gated(rx));
        tokio::pin!(pending);
        assert!(futures::poll!(pending.as_mut()).is_pending());

        // Nobody is watching, so nothing is re-run
        assert!(!cache.invalidate(&key));
        assert_eq!(cache.snapshot(&key).status, QueryStatus::Stale);
        tokio::task::yield_now().await;
        assert!(futures::poll!(pending.as_mut()).is_pending());

        tx.send(json!(1)).unwrap();
        assert_eq!(pending.await, Ok(json!(1)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_stale_entry_is_not_served_as_fresh() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = cache.subscribe(&key);

        cache.fetch(&key, counting(calls.clone(), json!(1))).await.unwrap();
        cache.invalidate(&key);
        cache.fetch(&key, counting(calls.clone(), json!(2))).await.unwrap();
        assert_eq!(cache.snapshot(&key).data, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_unsubscribed_fetches_leave_no_entries() {
        let cache = QueryCache::new(SyncConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        for term in ["h", "ha", "hal", "hall"] {
            let key = QueryKey::new("venues").with("list").with("org-1").with(term);
            cache.fetch(&key, counting(calls.clone(), json!([]))).await.unwrap();
        }
        cache.fetch(&key(), failing(500)).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribed_superseded_fetch_keeps_entry_until_latest_lands() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();

        let first = cache.fetch(&key, gated(rx1));
        let second = cache.fetch(&key, gated(rx2));
        tokio::pin!(first);
        tokio::pin!(second);
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert!(futures::poll!(second.as_mut()).is_pending());

        tx1.send(json!("first")).unwrap();
        first.await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.snapshot(&key).is_fetching);

        tx2.send(json!("second")).unwrap();
        second.await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_twice_refetches_once() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut sub = cache.subscribe(&key);

        cache.fetch(&key, counting(calls.clone(), json!(1))).await.unwrap();
        assert!(cache.invalidate(&key));
        assert!(!cache.invalidate(&key));

        let settled = sub.wait_for(|e| !e.is_fetching).await.expect("cache alive");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // The refetch may have started before the second write
        assert_eq!(settled.status, QueryStatus::Stale);
        assert!(!settled.is_fresh());
    }

    #[tokio::test]
    async fn test_refetch_after_second_invalidate_lands_stale() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let mut sub = cache.subscribe(&key);

        let gates: Arc<Mutex<VecDeque<oneshot::Receiver<Value>>>> = Arc::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        gates.lock().unwrap().extend([rx1, rx2]);
        let calls = Arc::new(AtomicUsize::new(0));
        let queued: Loader = {
            let gates = gates.clone();
            let calls = calls.clone();
            Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let rx = gates.lock().unwrap().pop_front();
                async move {
                    match rx {
                        Some(rx) => rx.await.map_err(RawFailure::no_response),
                        None => Err(RawFailure::no_response("no response queued")),
                    }
                }
                .boxed()
            })
        };

        tx1.send(json!("before")).unwrap();
        cache.fetch(&key, queued.clone()).await.unwrap();

        assert!(cache.invalidate(&key));
        tokio::task::yield_now().await;
        assert!(!cache.invalidate(&key));

        tx2.send(json!("after-first-write")).unwrap();
        let settled = sub.wait_for(|e| !e.is_fetching).await.expect("cache alive");
        assert_eq!(settled.data, Some(json!("after-first-write")));
        assert_eq!(settled.status, QueryStatus::Stale);
        assert!(settled.stale_after.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The next read goes back to the server
        let (tx3, rx3) = oneshot::channel();
        gates.lock().unwrap().push_back(rx3);
        tx3.send(json!("after-second-write")).unwrap();
        let latest = cache.fetch(&key, queued).await.unwrap();
        assert_eq!(latest, json!("after-second-write"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.snapshot(&key).status, QueryStatus::Success);
    }

    #[tokio::test]
    async fn test_invalidate_leaves_never_loaded_entry_idle() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let _sub = cache.subscribe(&key);

        assert!(!cache.invalidate(&key));
        assert_eq!(cache.invalidate_matching(&QueryKey::new("venues")), 1);
        let entry = cache.snapshot(&key);
        assert_eq!(entry.status, QueryStatus::Idle);
        assert!(!entry.is_fetching);

        // The first load still shows as a plain load
        let (tx, rx) = oneshot::channel();
        let first = cache.fetch(&key, gated(rx));
        tokio::pin!(first);
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert_eq!(cache.snapshot(&key).status, QueryStatus::Loading);
        tx.send(json!([])).unwrap();
        first.await.unwrap();
        assert_eq!(cache.snapshot(&key).status, QueryStatus::Success);
    }

    #[tokio::test]
    async fn test_invalidate_supersedes_plain_fetch_in_flight() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let _sub = cache.subscribe(&key);
        let (tx, rx) = oneshot::channel();

        let slow = cache.fetch(&key, gated(rx));
        tokio::pin!(slow);
        assert!(futures::poll!(slow.as_mut()).is_pending());
        let issued_before = cache.snapshot(&key).fetch_seq;

        assert!(cache.invalidate(&key));
        assert!(cache.snapshot(&key).fetch_seq > issued_before);

        // The refetch re-runs the single-use loader and fails; the old
        // response then arrives late and must be dropped.
        tokio::task::yield_now().await;
        tx.send(json!("old")).unwrap();
        slow.await.unwrap();
        assert_ne!(cache.snapshot(&key).data, Some(json!("old")));
    }

    #[tokio::test]
    async fn test_invalidate_matching_prefix() {
        let cache = QueryCache::new(SyncConfig::default());
        let a = QueryKey::new("venues").with("list").with("org-1").with("hall");
        let b = QueryKey::new("venues").with("list").with("org-1").with("");
        let c = QueryKey::new("venues").with("list").with("org-2").with("");
        let _subs: Vec<Subscription> = [&a, &b, &c].map(|k| cache.subscribe(k)).into();
        for k in [&a, &b, &c] {
            cache.fetch(k, counting(Arc::new(AtomicUsize::new(0)), json!([]))).await.unwrap();
        }

        let pattern = QueryKey::new("venues").with("list").with("org-1");
        assert_eq!(cache.invalidate_matching(&pattern), 2);
        assert_eq!(cache.snapshot(&a).status, QueryStatus::Stale);
        assert_eq!(cache.snapshot(&b).status, QueryStatus::Stale);
        assert_eq!(cache.snapshot(&c).status, QueryStatus::Success);
    }

    #[tokio::test]
    async fn test_last_subscriber_detach_removes_entry() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let first = cache.subscribe(&key);
        let second = cache.subscribe(&key);
        cache.fetch(&key, counting(Arc::new(AtomicUsize::new(0)), json!(1))).await.unwrap();

        drop(first);
        assert_eq!(cache.len(), 1);
        drop(second);
        assert!(cache.is_empty());
        assert_eq!(cache.snapshot(&key).status, QueryStatus::Idle);
    }

    #[tokio::test]
    async fn test_late_response_after_detach_is_dropped() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let sub = cache.subscribe(&key);
        let (tx, rx) = oneshot::channel();

        let pending = cache.fetch(&key, gated(rx));
        tokio::pin!(pending);
        assert!(futures::poll!(pending.as_mut()).is_pending());
        drop(sub);

        tx.send(json!(1)).unwrap();
        assert_eq!(pending.await, Ok(json!(1)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_subscription_sees_updates_and_clear() {
        let cache = QueryCache::new(SyncConfig::default());
        let key = key();
        let mut sub = cache.subscribe(&key);
        assert_eq!(sub.current().status, QueryStatus::Idle);

        cache.fetch(&key, counting(Arc::new(AtomicUsize::new(0)), json!(7))).await.unwrap();
        let latest = sub.changed().await.expect("update");
        assert_eq!(latest.data, Some(json!(7)));

        cache.clear();
        assert!(sub.changed().await.is_none());
        assert!(cache.is_empty());

        // A new subscription on the same key must not be detached by the old guard
        let fresh = cache.subscribe(&key);
        drop(sub);
        assert_eq!(cache.len(), 1);
        drop(fresh);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_data_as_and_age_display() {
        let mut entry = CacheEntry::idle(key());
        assert!(entry.data_as::<Vec<i32>>().is_none());
        assert_eq!(entry.age_display(), "never");

        entry.data = Some(json!([1, 2]));
        entry.updated_at = Some(Utc::now());
        assert_eq!(entry.data_as::<Vec<i32>>().unwrap().unwrap(), vec![1, 2]);
        assert_eq!(entry.age_display(), "just now");

        entry.updated_at = Some(Utc::now() - chrono::Duration::minutes(90));
        assert_eq!(entry.age_display(), "1h ago");
    }
}
