//! # Query Cache
//!
//! Keyed store of remote results with staleness, request de-duplication,
//! stale-while-revalidate and per-entry polling.
//!
//! ## Read Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       get(key, fetcher, policy)                         │
//! │                                                                         │
//! │   no entry / no value ──────────────► start fetch          (Fetched)    │
//! │   fetch already running ────────────► join it              (Collapsed)  │
//! │   now - fetched_at <  stale_time ───► return value         (CacheHit)   │
//! │   now - fetched_at >= stale_time ───► return value AND                  │
//! │                                       fetch in background  (Revalidating)│
//! │                                                                         │
//! │   background success ──► value + fetched_at replaced together           │
//! │   background failure ──► value kept, error = StaleDataServed            │
//! │   failure, no value  ──► status = Error                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sequencing
//! Every fetch takes the next per-key sequence number. A completion whose
//! sequence is not newer than the last applied one (fetch or direct patch)
//! is dropped, so a slow revalidation never overwrites the result of an
//! invalidation that started after it. Only a fetch issued after the latest
//! invalidation clears the invalidated flag. A direct patch on a subscribed
//! entry that is still invalidated starts a new fetch, since the patch
//! superseded the one the invalidation started.
//!
//! ## Lifetime
//! Entries are created on first read. A [`QuerySubscription`] keeps one
//! alive; after the last subscription drops the entry survives `gc_time`
//! and is then evicted (an in-flight fetch postpones eviction until it
//! completes). Dropping the last subscription stops its polling timer but
//! never cancels a running fetch.
//!
//! All state sits behind one `std::sync::Mutex` that is never held across
//! an `.await`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use orbit_core::{CacheKey, ErrorInfo, ErrorKind, PollingPolicy, QueryStatus};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Fetchers
// =============================================================================

/// Type-erased producer of a fresh value for one key.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, SyncResult<Value>> + Send + Sync>;

/// Wraps an async closure as a [`Fetcher`].
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<Value>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

// =============================================================================
// Public Snapshots
// =============================================================================

/// Point-in-time copy of one cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Option<Value>,
    pub fetched_at: Option<Instant>,
    pub status: QueryStatus,
    pub error: Option<ErrorInfo>,
    /// Effective stale time from the strictest active policy.
    pub stale_after: Duration,
    /// Marked stale by an invalidation and not refetched yet.
    pub invalidated: bool,
    pub is_fetching: bool,
    pub subscribers: usize,
}

impl CacheEntry {
    pub fn is_stale(&self) -> bool {
        match self.fetched_at {
            Some(at) => self.invalidated || at.elapsed() >= self.stale_after,
            None => true,
        }
    }

    /// Deserializes the cached value.
    pub fn data<T: DeserializeOwned>(&self) -> SyncResult<Option<T>> {
        self.value
            .as_ref()
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(SyncError::from)
    }
}

/// What a read did besides returning the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Fresh value served, nothing fetched.
    CacheHit,
    /// No value yet; a fetch was started.
    Fetched,
    /// Joined a fetch that was already running.
    Collapsed,
    /// Stale value served; a background fetch was started.
    Revalidating,
}

impl FetchOutcome {
    /// The informational error kind for joined fetches.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            FetchOutcome::Collapsed => Some(ErrorKind::ConcurrentFetchCollapsed),
            _ => None,
        }
    }
}

/// Result of [`QueryCache::get`].
#[derive(Debug, Clone)]
pub struct CacheRead {
    pub entry: CacheEntry,
    pub outcome: FetchOutcome,
}

// =============================================================================
// Internal State
// =============================================================================

struct Poller {
    interval: Duration,
    task: JoinHandle<()>,
}

struct Slot {
    value: Option<Value>,
    fetched_at: Option<Instant>,
    status: QueryStatus,
    error: Option<ErrorInfo>,
    invalidated: bool,

    fetcher: Option<Fetcher>,
    /// Policy of the last unsubscribed read; used while nobody subscribes.
    fallback_policy: PollingPolicy,
    subscribers: HashMap<u64, PollingPolicy>,

    next_seq: u64,
    last_applied: u64,
    /// `next_seq` at the latest invalidation.
    invalidated_seq: u64,
    inflight: Option<u64>,

    poller: Option<Poller>,
    gc: Option<JoinHandle<()>>,
    version: watch::Sender<u64>,
}

impl Slot {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Slot {
            value: None,
            fetched_at: None,
            status: QueryStatus::Idle,
            error: None,
            invalidated: false,
            fetcher: None,
            fallback_policy: PollingPolicy::default(),
            subscribers: HashMap::new(),
            next_seq: 0,
            last_applied: 0,
            invalidated_seq: 0,
            inflight: None,
            poller: None,
            gc: None,
            version,
        }
    }

    fn effective_policy(&self) -> Option<PollingPolicy> {
        if self.subscribers.is_empty() {
            Some(self.fallback_policy).filter(|p| p.enabled)
        } else {
            PollingPolicy::strictest(self.subscribers.values())
        }
    }

    fn stale_time(&self) -> Duration {
        self.effective_policy()
            .map(|p| p.stale_time)
            .unwrap_or(self.fallback_policy.stale_time)
    }

    fn is_stale(&self, now: Instant, stale_time: Duration) -> bool {
        match self.fetched_at {
            Some(at) => self.invalidated || now.saturating_duration_since(at) >= stale_time,
            None => true,
        }
    }

    /// Consumes a sequence number so every in-flight fetch is superseded.
    fn supersede_inflight(&mut self) {
        self.next_seq += 1;
        self.last_applied = self.next_seq;
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn snapshot(&self, key: &CacheKey) -> CacheEntry {
        CacheEntry {
            key: key.clone(),
            value: self.value.clone(),
            fetched_at: self.fetched_at,
            status: self.status,
            error: self.error.clone(),
            stale_after: self.stale_time(),
            invalidated: self.invalidated,
            is_fetching: self.inflight.is_some(),
            subscribers: self.subscribers.len(),
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.task.abort();
        }
        if let Some(gc) = self.gc.take() {
            gc.abort();
        }
    }
}

struct Inner {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    gc_time: Duration,
    next_subscriber: AtomicU64,
}

/// Spawns on the current runtime, if there is one.
///
/// Subscriptions may be dropped after the runtime is gone; their cleanup
/// then simply skips the timers.
fn spawn_task<F>(fut: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::runtime::Handle::try_current()
        .ok()
        .map(|handle| handle.spawn(fut))
}

// =============================================================================
// Query Cache
// =============================================================================

/// Shared query cache handle. Cloning is cheap and shares the entries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    pub fn new(gc_time: Duration) -> Self {
        QueryCache {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                gc_time,
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| QueryCache { inner })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads `key`, starting a fetch when the entry is missing or stale.
    ///
    /// Never waits: the returned snapshot may be `Loading` or stale. Use
    /// [`resolve`](Self::resolve) to wait for the result.
    pub fn get(&self, key: &CacheKey, fetcher: Fetcher, policy: PollingPolicy) -> CacheRead {
        let mut slots = self.lock();
        let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
        slot.fetcher = Some(fetcher);
        if slot.subscribers.is_empty() {
            slot.fallback_policy = policy;
        }

        let outcome = self.read_locked(key, slot, policy);
        if slot.subscribers.is_empty() {
            self.schedule_gc(key, slot);
        }

        CacheRead {
            entry: slot.snapshot(key),
            outcome,
        }
    }

    /// Reads `key` and waits until the entry settles.
    ///
    /// A stale value waits for its revalidation. Foreground failures (no
    /// value to fall back on) surface as [`SyncError::Query`].
    pub async fn resolve(
        &self,
        key: &CacheKey,
        fetcher: Fetcher,
        policy: PollingPolicy,
    ) -> SyncResult<CacheEntry> {
        let mut subscription = self.subscribe(key, fetcher, policy);
        subscription.settled().await
    }

    /// Registers an active subscriber and reads the entry.
    ///
    /// The subscriber's policy joins the strictest-policy merge and its
    /// refetch interval (if any) starts polling. Drop the returned handle
    /// to unsubscribe.
    pub fn subscribe(
        &self,
        key: &CacheKey,
        fetcher: Fetcher,
        policy: PollingPolicy,
    ) -> QuerySubscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let (outcome, version) = {
            let mut slots = self.lock();
            let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
            slot.fetcher = Some(fetcher);
            slot.subscribers.insert(id, policy);
            if let Some(gc) = slot.gc.take() {
                gc.abort();
            }
            self.sync_poller(key, slot);
            let outcome = self.read_locked(key, slot, policy);
            (outcome, slot.version.subscribe())
        };

        debug!(key = %key, ?outcome, "Subscribed");

        QuerySubscription {
            cache: self.clone(),
            key: key.clone(),
            id,
            version,
            outcome,
        }
    }

    fn read_locked(&self, key: &CacheKey, slot: &mut Slot, policy: PollingPolicy) -> FetchOutcome {
        if !policy.enabled {
            return FetchOutcome::CacheHit;
        }

        let now = Instant::now();
        let stale_time = slot.stale_time().min(policy.stale_time);

        if slot.inflight.is_some() {
            if slot.value.is_some() && !slot.is_stale(now, stale_time) {
                return FetchOutcome::CacheHit;
            }
            debug!(key = %key, "Joining in-flight fetch");
            return FetchOutcome::Collapsed;
        }

        if slot.value.is_none() {
            self.start_fetch(key, slot);
            return FetchOutcome::Fetched;
        }

        if slot.is_stale(now, stale_time) {
            debug!(key = %key, "Serving stale value, revalidating");
            self.start_fetch(key, slot);
            return FetchOutcome::Revalidating;
        }

        debug!(key = %key, "Cache hit");
        FetchOutcome::CacheHit
    }

    // =========================================================================
    // Fetch Lifecycle
    // =========================================================================

    fn start_fetch(&self, key: &CacheKey, slot: &mut Slot) {
        let Some(fetcher) = slot.fetcher.clone() else {
            return;
        };

        slot.next_seq += 1;
        let seq = slot.next_seq;

        let fut = fetcher();
        let weak = Arc::downgrade(&self.inner);
        let task_key = key.clone();
        let spawned = spawn_task(async move {
            let result = fut.await;
            if let Some(cache) = QueryCache::from_weak(&weak) {
                cache.complete(&task_key, seq, result);
            }
        });
        if spawned.is_none() {
            warn!(key = %key, seq, "No runtime, fetch not started");
            return;
        }

        slot.inflight = Some(seq);
        if slot.value.is_none() {
            slot.status = QueryStatus::Loading;
        }
        if let Some(gc) = slot.gc.take() {
            gc.abort();
        }
        slot.bump();

        debug!(key = %key, seq, "Fetch started");
    }

    fn complete(&self, key: &CacheKey, seq: u64, result: SyncResult<Value>) {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(key) else {
            debug!(key = %key, seq, "Fetch finished for evicted entry");
            return;
        };

        if slot.inflight == Some(seq) {
            slot.inflight = None;
        }

        if seq <= slot.last_applied {
            debug!(key = %key, seq, last_applied = slot.last_applied, "Dropping superseded fetch result");
        } else {
            slot.last_applied = seq;
            match result {
                Ok(value) => {
                    slot.value = Some(value);
                    slot.fetched_at = Some(Instant::now());
                    slot.status = QueryStatus::Success;
                    slot.error = None;
                    if seq > slot.invalidated_seq {
                        slot.invalidated = false;
                    }
                    debug!(key = %key, seq, "Fetch applied");
                }
                Err(err) => {
                    let info = err.info();
                    if slot.value.is_some() {
                        warn!(key = %key, error = %err, "Background refresh failed, serving stale value");
                        slot.status = QueryStatus::Success;
                        slot.error = Some(info.stale());
                    } else {
                        warn!(key = %key, error = %err, "Fetch failed");
                        slot.status = QueryStatus::Error;
                        slot.error = Some(info);
                    }
                }
            }
        }

        slot.bump();
        if slot.subscribers.is_empty() {
            self.schedule_gc(key, slot);
        }
    }

    // =========================================================================
    // Polling
    // =========================================================================

    fn poll_interval(slot: &Slot) -> Option<Duration> {
        if slot.subscribers.is_empty() {
            return None;
        }
        slot.effective_policy()
            .and_then(|p| p.refetch_interval)
            .filter(|i| !i.is_zero())
    }

    /// Starts, stops or retimes the poller to match the effective interval.
    fn sync_poller(&self, key: &CacheKey, slot: &mut Slot) {
        let interval = Self::poll_interval(slot);
        if let (Some(poller), Some(every)) = (&slot.poller, interval) {
            if poller.interval == every {
                return;
            }
        }
        self.restart_poller(key, slot);
    }

    fn restart_poller(&self, key: &CacheKey, slot: &mut Slot) {
        if let Some(poller) = slot.poller.take() {
            poller.task.abort();
        }
        let Some(every) = Self::poll_interval(slot) else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let poll_key = key.clone();
        let task = spawn_task(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = QueryCache::from_weak(&weak) else {
                    break;
                };
                cache.poll_tick(&poll_key);
            }
        });

        if let Some(task) = task {
            debug!(key = %key, ?every, "Polling started");
            slot.poller = Some(Poller {
                interval: every,
                task,
            });
        }
    }

    fn poll_tick(&self, key: &CacheKey) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(key) {
            if slot.inflight.is_none() {
                debug!(key = %key, "Polling refetch");
                self.start_fetch(key, slot);
            }
        }
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    fn schedule_gc(&self, key: &CacheKey, slot: &mut Slot) {
        if let Some(old) = slot.gc.take() {
            old.abort();
        }
        if !slot.subscribers.is_empty() || slot.inflight.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let gc_key = key.clone();
        let gc_time = self.inner.gc_time;
        slot.gc = spawn_task(async move {
            tokio::time::sleep(gc_time).await;
            if let Some(cache) = QueryCache::from_weak(&weak) {
                cache.evict_if_idle(&gc_key);
            }
        });
    }

    fn evict_if_idle(&self, key: &CacheKey) {
        let mut slots = self.lock();
        let idle = slots
            .get(key)
            .map(|s| s.subscribers.is_empty() && s.inflight.is_none())
            .unwrap_or(false);
        if idle {
            if let Some(mut slot) = slots.remove(key) {
                // The running task is this gc timer; let it finish.
                slot.gc.take();
            }
            debug!(key = %key, "Evicted idle entry");
        }
    }

    fn unsubscribe(&self, key: &CacheKey, id: u64) {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        slot.subscribers.remove(&id);
        self.sync_poller(key, slot);
        if slot.subscribers.is_empty() {
            self.schedule_gc(key, slot);
        }
        debug!(key = %key, remaining = slot.subscribers.len(), "Unsubscribed");
    }

    fn update_policy(&self, key: &CacheKey, id: u64, policy: PollingPolicy) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(key) {
            if let Some(p) = slot.subscribers.get_mut(&id) {
                *p = policy;
            }
            self.sync_poller(key, slot);
        }
    }

    // =========================================================================
    // Invalidation & Direct Writes
    // =========================================================================

    /// Marks every entry under `prefix` stale.
    ///
    /// Entries with subscribers refetch now (superseding any running fetch)
    /// and restart their polling timer; the rest refetch on next read.
    /// Returns the number of entries matched.
    pub fn invalidate(&self, prefix: &CacheKey) -> usize {
        let mut slots = self.lock();
        let mut matched = 0;
        for (key, slot) in slots.iter_mut().filter(|(k, _)| k.starts_with(prefix)) {
            matched += 1;
            slot.invalidated = true;
            slot.invalidated_seq = slot.next_seq;
            if !slot.subscribers.is_empty() && slot.effective_policy().is_some() {
                self.start_fetch(key, slot);
                self.restart_poller(key, slot);
            }
            slot.bump();
        }
        info!(prefix = %prefix, matched, "Invalidated cache entries");
        matched
    }

    /// Replaces the value of an existing entry.
    ///
    /// `updater` receives the current value and returns the new one, or
    /// `None` to leave the entry alone. Running fetches are superseded; a
    /// subscribed entry still waiting on an invalidation refetches.
    /// Returns true if the entry changed.
    pub fn set_data<F>(&self, key: &CacheKey, updater: F) -> bool
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        let Some(next) = updater(slot.value.as_ref()) else {
            return false;
        };

        slot.value = Some(next);
        slot.status = QueryStatus::Success;
        slot.error = None;
        if slot.fetched_at.is_none() {
            slot.fetched_at = Some(Instant::now());
        }
        slot.supersede_inflight();
        if slot.invalidated && !slot.subscribers.is_empty() && slot.effective_policy().is_some() {
            debug!(key = %key, "Patched entry still invalidated, refetching");
            self.start_fetch(key, slot);
        }
        slot.bump();
        debug!(key = %key, "Entry patched");
        true
    }

    /// Removes the value of an existing entry (the entity no longer exists).
    ///
    /// Settles any pending invalidation: there is nothing left to refetch.
    pub fn mark_absent(&self, key: &CacheKey) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        slot.value = None;
        slot.fetched_at = None;
        slot.status = QueryStatus::Idle;
        slot.error = None;
        slot.invalidated = false;
        slot.supersede_inflight();
        slot.bump();
        debug!(key = %key, "Entry marked absent");
        true
    }

    /// Forces a fetch for an existing entry. Joins a running one.
    ///
    /// Returns true if a fetch is now running.
    pub fn refetch(&self, key: &CacheKey) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        if slot.inflight.is_none() {
            self.start_fetch(key, slot);
        }
        slot.inflight.is_some()
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn snapshot(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.lock().get(key).map(|slot| slot.snapshot(key))
    }

    /// Change notifications for an existing entry.
    pub fn watch(&self, key: &CacheKey) -> Option<watch::Receiver<u64>> {
        self.lock().get(key).map(|slot| slot.version.subscribe())
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.lock().keys().cloned().collect()
    }

    /// Keys under `prefix`.
    pub fn keys_with_prefix(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        self.lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// An active subscriber of one entry. Dropping it unsubscribes.
pub struct QuerySubscription {
    cache: QueryCache,
    key: CacheKey,
    id: u64,
    version: watch::Receiver<u64>,
    outcome: FetchOutcome,
}

impl QuerySubscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// What the initial read did.
    pub fn outcome(&self) -> FetchOutcome {
        self.outcome
    }

    pub fn entry(&self) -> Option<CacheEntry> {
        self.cache.snapshot(&self.key)
    }

    /// Waits for the next change of the entry.
    pub async fn changed(&mut self) -> SyncResult<()> {
        self.version
            .changed()
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    /// Waits until no fetch is running and the entry is not loading.
    pub async fn settled(&mut self) -> SyncResult<CacheEntry> {
        loop {
            let entry = self.entry().ok_or(SyncError::ShuttingDown)?;
            if !entry.is_fetching && entry.status != QueryStatus::Loading {
                if entry.status == QueryStatus::Error {
                    let info = entry.error.clone().ok_or(SyncError::ShuttingDown)?;
                    return Err(SyncError::Query(info));
                }
                return Ok(entry);
            }
            self.changed().await?;
        }
    }

    /// Forces a fetch (joins a running one).
    pub fn refetch(&self) -> bool {
        self.cache.refetch(&self.key)
    }

    /// Replaces this subscriber's policy.
    pub fn set_policy(&self, policy: PollingPolicy) {
        self.cache.update_policy(&self.key, self.id, policy);
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.cache.unsubscribe(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_core::cache_key;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting(calls: Arc<AtomicUsize>, value: Value, delay: Duration) -> Fetcher {
        fetcher(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
        })
    }

    fn fresh_for(secs: u64) -> PollingPolicy {
        PollingPolicy::stale_for(Duration::from_secs(secs))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reads_collapse_into_one_fetch() {
        let cache = QueryCache::new(Duration::from_secs(300));
        let key = cache_key!["dashboard", "stats"];
        let calls = Arc::new(AtomicUsize::new(0));
        let f = counting(calls.clone(), json!({"totalOrders": 5}), Duration::from_millis(100));

        let first = cache.get(&key, f.clone(), fresh_for(30));
        let second = cache.get(&key, f.clone(), fresh_for(30));
        assert_eq!(first.outcome, FetchOutcome::Fetched);
        assert_eq!(first.entry.status, QueryStatus::Loading);
        assert_eq!(second.outcome, FetchOutcome::Collapsed);
        assert_eq!(
            second.outcome.error_kind(),
            Some(ErrorKind::ConcurrentFetchCollapsed)
        );

        let (a, b) = tokio::join!(
            cache.resolve(&key, f.clone(), fresh_for(30)),
            cache.resolve(&key, f.clone(), fresh_for(30)),
        );
        assert_eq!(a.unwrap().value, Some(json!({"totalOrders": 5})));
        assert_eq!(b.unwrap().status, QueryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_after_window_serves_then_revalidates() {
        let cache = QueryCache::new(Duration::from_secs(300));
        let key = cache_key!["dashboard", "kpis", "30d"];
        let calls = Arc::new(AtomicUsize::new(0));
        let f = counting(calls.clone(), json!(1), Duration::ZERO);

        cache.resolve(&key, f.clone(), fresh_for(10)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        let read = cache.get(&key, f.clone(), fresh_for(10));
        assert_eq!(read.outcome, FetchOutcome::CacheHit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let read = cache.get(&key, f.clone(), fresh_for(10));
        assert_eq!(read.outcome, FetchOutcome::Revalidating);
        assert_eq!(read.entry.value, Some(json!(1)));
        assert_eq!(read.entry.status, QueryStatus::Success);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_last_good_value() {
        let cache = QueryCache::new(Duration::from_secs(300));
        let key = cache_key!["dashboard", "stats"];
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let f = fetcher(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok(json!("v1"))
                } else {
                    Err(SyncError::ConnectionFailed("reset by peer".into()))
                }
            }
        });

        cache.resolve(&key, f.clone(), fresh_for(0)).await.unwrap();
        let entry = cache.resolve(&key, f.clone(), fresh_for(0)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(entry.status, QueryStatus::Success);
        assert_eq!(entry.value, Some(json!("v1")));
        let err = entry.error.unwrap();
        assert_eq!(err.kind, ErrorKind::StaleDataServed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_value_is_error() {
        let cache = QueryCache::new(Duration::from_secs(300));
        let key = cache_key!["security", "config"];
        let f = fetcher(|| async { Err(SyncError::Http { status: 502, body: "bad gateway".into() }) });

        let err = cache.resolve(&key, f, fresh_for(30)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        let entry = cache.snapshot(&key).unwrap();
        assert_eq!(entry.status, QueryStatus::Error);
        assert!(entry.value.is_none());
        assert!(entry.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refcounted_eviction_and_reuse() {
        let cache = QueryCache::new(Duration::from_secs(60));
        let key = cache_key!["orders", "detail", "ord-1"];
        let calls = Arc::new(AtomicUsize::new(0));
        let f = counting(calls.clone(), json!({"id": "ord-1"}), Duration::ZERO);

        let mut first = cache.subscribe(&key, f.clone(), fresh_for(300));
        first.settled().await.unwrap();
        let second = cache.subscribe(&key, f.clone(), fresh_for(300));
        assert_eq!(second.outcome(), FetchOutcome::CacheHit);
        drop(first);
        drop(second);

        // Remounted within the grace period: same entry, no refetch.
        tokio::time::sleep(Duration::from_secs(30)).await;
        let again = cache.subscribe(&key, f.clone(), fresh_for(300));
        assert_eq!(again.outcome(), FetchOutcome::CacheHit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        drop(again);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.snapshot(&key).is_none());
        assert!(cache.is_empty());

        let fresh = cache.subscribe(&key, f.clone(), fresh_for(300));
        assert_eq!(fresh.outcome(), FetchOutcome::Fetched);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_gc_time_evicts_when_idle() {
        let cache = QueryCache::new(Duration::ZERO);
        let key = cache_key!["dashboard", "stats"];
        let calls = Arc::new(AtomicUsize::new(0));
        let f = counting(calls.clone(), json!(1), Duration::from_millis(50));

        let sub = cache.subscribe(&key, f.clone(), fresh_for(30));
        drop(sub);
        // The fetch is still running and keeps the entry alive.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.snapshot(&key).is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.snapshot(&key).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_runs_only_while_subscribed() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let key = cache_key!["dashboard", "activity", 20u32];
        let calls = Arc::new(AtomicUsize::new(0));
        let f = counting(calls.clone(), json!([]), Duration::ZERO);
        let policy = fresh_for(60).polling(Duration::from_secs(120));

        let mut sub = cache.subscribe(&key, f.clone(), policy);
        sub.settled().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        drop(sub);
        tokio::time::sleep(Duration::from_secs(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strictest_interval_governs_shared_entry() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let key = cache_key!["dashboard", "stats"];
        let calls = Arc::new(AtomicUsize::new(0));
        let f = counting(calls.clone(), json!(1), Duration::ZERO);

        let mut slow = cache.subscribe(&key, f.clone(), fresh_for(30).polling(Duration::from_secs(300)));
        slow.settled().await.unwrap();
        let fast = cache.subscribe(&key, f.clone(), fresh_for(30).polling(Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        drop(fast);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_prefix_refetches_subscribed_only() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let key30 = cache_key!["dashboard", "kpis", "30d"];
        let key7 = cache_key!["dashboard", "kpis", "7d"];
        let calls30 = Arc::new(AtomicUsize::new(0));
        let calls7 = Arc::new(AtomicUsize::new(0));
        let f30 = counting(calls30.clone(), json!({"revenue": 123456}), Duration::ZERO);
        let f7 = counting(calls7.clone(), json!({"revenue": 1000}), Duration::ZERO);

        let mut mounted = cache.subscribe(&key30, f30.clone(), fresh_for(60));
        mounted.settled().await.unwrap();
        cache.resolve(&key7, f7.clone(), fresh_for(60)).await.unwrap();

        assert_eq!(cache.invalidate(&cache_key!["dashboard", "kpis"]), 2);
        assert!(cache.snapshot(&key30).unwrap().is_fetching);
        let idle = cache.snapshot(&key7).unwrap();
        assert!(!idle.is_fetching);
        assert!(idle.invalidated);

        mounted.settled().await.unwrap();
        assert_eq!(calls30.load(Ordering::SeqCst), 2);
        assert_eq!(calls7.load(Ordering::SeqCst), 1);

        let read = cache.get(&key7, f7.clone(), fresh_for(60));
        assert_eq!(read.outcome, FetchOutcome::Revalidating);
        assert_eq!(calls7.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_fetch_never_wins() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let key = cache_key!["orders", "list", 1u32, 25u32];
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let f = fetcher(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!("old"))
                } else {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(json!("new"))
                }
            }
        });

        let _sub = cache.subscribe(&key, f, fresh_for(60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cache.invalidate(&cache_key!["orders"]);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(cache.snapshot(&key).unwrap().value, Some(json!("new")));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let entry = cache.snapshot(&key).unwrap();
        assert_eq!(entry.value, Some(json!("new")));
        assert!(!entry.is_fetching);
    }

    fn numbered(calls: Arc<AtomicUsize>, delay: Duration) -> Fetcher {
        fetcher(move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tokio::time::sleep(delay).await;
                Ok(json!(n))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_patch_during_invalidation_refetch_refetches_again() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let key = cache_key!["orders", "list", 1u32, 25u32];
        let calls = Arc::new(AtomicUsize::new(0));
        let f = numbered(calls.clone(), Duration::from_secs(1));

        let mut sub = cache.subscribe(&key, f, fresh_for(60));
        sub.settled().await.unwrap();

        cache.invalidate(&cache_key!["orders"]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.set_data(&key, |_| Some(json!("patched"))));

        let entry = cache.snapshot(&key).unwrap();
        assert_eq!(entry.value, Some(json!("patched")));
        assert!(entry.is_fetching);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let entry = cache.snapshot(&key).unwrap();
        assert_eq!(entry.value, Some(json!(3)));
        assert!(!entry.invalidated);
        assert!(!entry.is_fetching);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_patch_without_pending_invalidation_does_not_fetch() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let key = cache_key!["products", "detail", "p-1"];
        let calls = Arc::new(AtomicUsize::new(0));
        let f = numbered(calls.clone(), Duration::ZERO);

        let mut sub = cache.subscribe(&key, f, fresh_for(60));
        sub.settled().await.unwrap();
        assert!(cache.set_data(&key, |_| Some(json!("patched"))));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.snapshot(&key).unwrap().value, Some(json!("patched")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_issued_before_invalidation_keeps_entry_stale() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let key = cache_key!["dashboard", "stats"];
        let calls = Arc::new(AtomicUsize::new(0));
        let f = numbered(calls.clone(), Duration::from_secs(1));

        let first = cache.get(&key, f.clone(), fresh_for(60));
        assert_eq!(first.outcome, FetchOutcome::Fetched);

        tokio::time::sleep(Duration::from_millis(500)).await;
        cache.invalidate(&cache_key!["dashboard"]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let entry = cache.snapshot(&key).unwrap();
        assert_eq!(entry.value, Some(json!(1)));
        assert!(entry.invalidated);

        let read = cache.get(&key, f.clone(), fresh_for(60));
        assert_eq!(read.outcome, FetchOutcome::Revalidating);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let entry = cache.snapshot(&key).unwrap();
        assert_eq!(entry.value, Some(json!(2)));
        assert!(!entry.invalidated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_change_retimes_polling() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let key = cache_key!["dashboard", "stats"];
        let calls = Arc::new(AtomicUsize::new(0));
        let f = numbered(calls.clone(), Duration::ZERO);

        let mut sub = cache.subscribe(&key, f, fresh_for(30).polling(Duration::from_secs(300)));
        sub.settled().await.unwrap();

        sub.set_policy(fresh_for(30).polling(Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        sub.set_policy(fresh_for(30));
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_read_without_runtime_does_not_stick_loading() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let key = cache_key!["security", "config"];
        let f = numbered(Arc::new(AtomicUsize::new(0)), Duration::ZERO);

        let read = cache.get(&key, f, fresh_for(60));
        assert!(!read.entry.is_fetching);
        assert_ne!(read.entry.status, QueryStatus::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_patch_and_mark_absent() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let key = cache_key!["products", "detail", "p-1"];
        let f = counting(Arc::new(AtomicUsize::new(0)), json!({"id": "p-1", "name": "Lamp"}), Duration::ZERO);
        let _sub = cache.subscribe(&key, f, fresh_for(60));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(cache.set_data(&key, |v| {
            let mut next = v.cloned()?;
            next["name"] = json!("Desk Lamp");
            Some(next)
        }));
        assert_eq!(cache.snapshot(&key).unwrap().value.unwrap()["name"], "Desk Lamp");

        assert!(cache.mark_absent(&key));
        let entry = cache.snapshot(&key).unwrap();
        assert_eq!(entry.status, QueryStatus::Idle);
        assert!(entry.value.is_none());

        assert!(!cache.set_data(&cache_key!["missing"], |_| Some(json!(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_policy_never_fetches() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let key = cache_key!["security", "events", 50u32];
        let calls = Arc::new(AtomicUsize::new(0));
        let f = counting(calls.clone(), json!([]), Duration::ZERO);

        let entry = cache.resolve(&key, f, fresh_for(30).disabled()).await.unwrap();
        assert_eq!(entry.status, QueryStatus::Idle);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_data() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let key = cache_key!["n"];
        let f = counting(Arc::new(AtomicUsize::new(0)), json!([1, 2, 3]), Duration::ZERO);
        let entry = cache.resolve(&key, f, fresh_for(60)).await.unwrap();
        let data: Option<Vec<u32>> = entry.data().unwrap();
        assert_eq!(data, Some(vec![1, 2, 3]));
        assert!(entry.data::<String>().is_err());
    }
}
