//! Bounded cache store with request coalescing and LRU eviction
//!
//! Three independent locks guard the three pieces of shared state:
//!
//! - the LRU table (key -> entry, recency order, expiry)
//! - each entry's own state (payload, status, waiters), see [`CacheEntry`]
//! - the tracked aggregate size
//!
//! Growth is reserved against the memory budget before any payload is
//! written, evicting least recently used entries until the reservation fits.
//! Every removal, whatever its reason, goes through [`BoundedCache::teardown`],
//! which retires the entry, wakes its waiters, and releases its bytes.

use crate::cache::{
    background::BackgroundTask,
    config::CacheConfig,
    entry::{CacheEntry, EntrySnapshot},
    invalidation::{InvalidationEvent, InvalidationReason},
    metrics::CacheMetrics,
    types::{AdmitOutcome, CacheKey, CacheStats, EntryStatus, StoreOutcome},
    usage::UsageTracker,
};
use crate::error::{CacheError, CapacityReason, Result};
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Table row: the shared entry plus its expiry deadline
struct Slot {
    entry: Arc<CacheEntry>,
    expires_at: Instant,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Memory-bounded, TTL-expiring cache with coalesced reads
pub struct BoundedCache {
    config: CacheConfig,

    /// Admission counters
    usage: UsageTracker,

    /// Key -> entry, in recency order
    table: Mutex<LruCache<CacheKey, Slot>>,

    /// Sum of `CacheEntry::size` over live entries, plus in-flight reservations
    size_bytes: Mutex<u64>,

    metrics: CacheMetrics,

    /// Periodic TTL purge, stopped when the cache is dropped
    _expiry_task: Option<BackgroundTask>,
}

impl BoundedCache {
    /// Create a new cache; background maintenance starts on the current
    /// tokio runtime if there is one.
    pub fn new(config: CacheConfig) -> Result<Arc<Self>> {
        config.validate()?;
        info!("Initializing bounded cache with config: {:?}", config);

        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        let usage = UsageTracker::new(config.usage_retention, config.usage_sweep_interval);

        Ok(Arc::new_cyclic(|weak| Self {
            _expiry_task: BackgroundTask::spawn_periodic(
                "ttl-purge",
                config.expiry_sweep_interval,
                weak.clone(),
                |cache: &BoundedCache| {
                    cache.purge_expired();
                },
            ),
            config,
            usage,
            table: Mutex::new(LruCache::new(capacity)),
            size_bytes: Mutex::new(0),
            metrics: CacheMetrics::new(),
        }))
    }

    /// Record a use of `key` and, once it is hot enough, reserve an entry
    /// for the caller's origin fetch.
    ///
    /// A new key gets an `Updating` entry. An existing entry from a failed
    /// generation is moved back to `Updating`. Anything else is left alone.
    pub fn init_cache(&self, key: &str) -> AdmitOutcome {
        let uses = self.usage.record_usage(key);
        if uses < self.config.min_uses {
            self.metrics.record_admission_rejection();
            debug!(key, uses, "below admission threshold");
            return AdmitOutcome::BelowThreshold { uses };
        }

        let now = Instant::now();
        let mut expired = None;
        let mut evicted = None;
        let existing = {
            let mut table = self.table.lock();
            if table.peek(key).is_some_and(|slot| slot.is_expired(now)) {
                expired = table.pop(key).map(|slot| (key.to_string(), slot));
            }
            match table.get(key) {
                Some(slot) => Some(Arc::clone(&slot.entry)),
                None => {
                    let slot = Slot {
                        entry: Arc::new(CacheEntry::new_updating(key)),
                        expires_at: now + self.config.ttl_with_jitter(),
                    };
                    evicted = table.push(key.to_string(), slot);
                    None
                }
            }
        };

        if let Some((expired_key, slot)) = expired {
            self.teardown(&expired_key, &slot.entry, InvalidationReason::Expired);
        }
        if let Some((evicted_key, slot)) = evicted {
            self.teardown(&evicted_key, &slot.entry, InvalidationReason::CapacityLimit);
        }

        match existing {
            None => {
                self.metrics.record_admission();
                debug!(key, uses, "admitted new cache key");
                AdmitOutcome::Admitted
            }
            Some(entry) if entry.begin_update(false) => {
                self.metrics.record_admission();
                debug!(key, uses, "re-admitted cache key for a new fetch");
                AdmitOutcome::Admitted
            }
            Some(_) => AdmitOutcome::AlreadyPresent,
        }
    }

    /// Plain lookup; marks the key recently used but touches neither usage
    /// counters nor entry state. Expired entries are dropped on sight.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let now = Instant::now();
        let expired = {
            let mut table = self.table.lock();
            match table.get(key) {
                Some(slot) if !slot.is_expired(now) => return Some(Arc::clone(&slot.entry)),
                Some(_) => table.pop(key),
                None => return None,
            }
        };

        if let Some(slot) = expired {
            self.teardown(key, &slot.entry, InvalidationReason::Expired);
        }
        None
    }

    /// Lookup that coalesces with an in-flight fetch of the same key.
    ///
    /// Unknown keys return `Ok(None)` at once. A pending entry is waited on
    /// until it is populated (the fresh value is returned), reaches another
    /// state (`StaleNotification`), or the wait is cancelled or times out.
    /// The in-flight fetch is never disturbed by a waiter giving up.
    pub async fn get_with_wait<C>(
        &self,
        cancel: C,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<EntrySnapshot>>
    where
        C: Future<Output = ()>,
    {
        let Some(entry) = self.get(key) else {
            self.metrics.record_miss();
            debug!(key, "cache miss");
            return Ok(None);
        };

        let snapshot = entry.snapshot();
        if !snapshot.status.is_pending() {
            self.record_lookup(key, &snapshot);
            return Ok(Some(snapshot));
        }

        debug!(key, "cache entry is updating, waiting");
        self.metrics.record_coalesced_wait();
        let state = match entry.wait_for_state_change(cancel, timeout).await {
            Ok(state) => state,
            Err(e) => {
                match e {
                    CacheError::CoalescingTimeout { .. } => self.metrics.record_wait_timeout(),
                    CacheError::CoalescingCancelled { .. } => {
                        self.metrics.record_wait_cancellation()
                    }
                    _ => {}
                }
                return Err(e);
            }
        };

        if state != EntryStatus::Exist {
            self.metrics.record_miss();
            return Err(CacheError::StaleNotification {
                key: key.to_string(),
                state,
            });
        }

        match self.get(key) {
            Some(entry) => {
                let snapshot = entry.snapshot();
                self.record_lookup(key, &snapshot);
                Ok(Some(snapshot))
            }
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
        }
    }

    fn record_lookup(&self, key: &str, snapshot: &EntrySnapshot) {
        if snapshot.status == EntryStatus::Exist {
            self.metrics.record_hit();
            debug!(key, size = snapshot.size(), "cache hit");
        } else {
            self.metrics.record_miss();
            debug!(key, status = %snapshot.status, "cache entry not servable");
        }
    }

    /// Store a fetched response for `key`.
    ///
    /// Admission-gated like [`init_cache`](Self::init_cache). Makes room by
    /// evicting least recently used entries, swaps the payload in, marks the
    /// entry `Exist`, and wakes every waiter. Fails with
    /// [`CacheError::Capacity`] when the value can never fit or the cache was
    /// drained without making enough room; pending waiters are then told the
    /// fetch failed.
    pub fn set(&self, key: &str, body: Bytes, headers: Bytes) -> Result<StoreOutcome> {
        let uses = self.usage.record_usage(key);
        if uses < self.config.min_uses {
            self.metrics.record_admission_rejection();
            debug!(key, uses, "below admission threshold, not storing");
            return Ok(StoreOutcome::BelowThreshold { uses });
        }

        let new_size = (body.len() + headers.len()) as u64;
        let result = self
            .check_value_size(new_size)
            .and_then(|()| self.store(key, body, headers, new_size));

        if let Err(e) = &result {
            self.metrics.record_capacity_rejection();
            warn!(key, size = new_size, "failed to save response in cache: {}", e);
            self.mark_failed(key);
        }
        result
    }

    fn check_value_size(&self, size: u64) -> Result<()> {
        if size > self.config.max_memory_bytes {
            return Err(CacheError::Capacity {
                size_bytes: size,
                limit_bytes: self.config.max_memory_bytes,
                reason: CapacityReason::ExceedsMemoryBudget,
            });
        }
        if size > self.config.max_entry_bytes {
            return Err(CacheError::Capacity {
                size_bytes: size,
                limit_bytes: self.config.max_entry_bytes,
                reason: CapacityReason::ExceedsEntryLimit,
            });
        }
        Ok(())
    }

    fn store(&self, key: &str, body: Bytes, headers: Bytes, new_size: u64) -> Result<StoreOutcome> {
        loop {
            match self.get(key) {
                Some(entry) => {
                    let _write = entry.lock_for_write();
                    let delta = new_size as i64 - entry.size() as i64;
                    let reserved = delta.max(0);
                    if reserved > 0 {
                        self.reserve(key, reserved as u64)?;
                    }

                    match entry.replace_payload(body.clone(), headers.clone()) {
                        Some(applied) => {
                            self.apply_size_delta(applied - reserved);
                            self.refresh_expiry(key, &entry);
                            self.metrics.record_store();
                            return Ok(StoreOutcome::Stored);
                        }
                        None => {
                            // Evicted while we were making room; retry as a fresh insert.
                            self.apply_size_delta(-reserved);
                        }
                    }
                }
                None => {
                    self.reserve(key, new_size)?;
                    let entry = Arc::new(CacheEntry::with_payload(key, body.clone(), headers.clone()));

                    let pushed = {
                        let mut table = self.table.lock();
                        if table.contains(key) {
                            None
                        } else {
                            let slot = Slot {
                                entry,
                                expires_at: Instant::now() + self.config.ttl_with_jitter(),
                            };
                            Some(table.push(key.to_string(), slot))
                        }
                    };

                    match pushed {
                        Some(evicted) => {
                            if let Some((evicted_key, slot)) = evicted {
                                self.teardown(&evicted_key, &slot.entry, InvalidationReason::CapacityLimit);
                            }
                            debug!(key, size = new_size, "inserted new cache entry");
                            self.metrics.record_store();
                            return Ok(StoreOutcome::Stored);
                        }
                        None => {
                            // Another request admitted the key meanwhile; update that entry instead.
                            self.apply_size_delta(-(new_size as i64));
                        }
                    }
                }
            }
        }
    }

    /// Reserve `required` bytes, evicting least recently used entries
    /// (never `protect`) until the reservation fits the budget.
    fn reserve(&self, protect: &str, required: u64) -> Result<()> {
        let budget = self.config.max_memory_bytes;
        loop {
            {
                let mut size = self.size_bytes.lock();
                if *size + required <= budget {
                    *size += required;
                    return Ok(());
                }
            }

            let victim = {
                let mut table = self.table.lock();
                pop_victim(&mut table, protect)
            };

            match victim {
                Some((victim_key, slot)) => {
                    self.teardown(&victim_key, &slot.entry, InvalidationReason::SizeLimit);
                }
                None => {
                    warn!("Cannot evict more entries, cache size limit exceeded");
                    return Err(CacheError::Capacity {
                        size_bytes: required,
                        limit_bytes: budget,
                        reason: CapacityReason::BudgetExhausted,
                    });
                }
            }
        }
    }

    fn apply_size_delta(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let mut size = self.size_bytes.lock();
        let updated = *size as i64 + delta;
        debug_assert!(updated >= 0, "tracked cache size went negative");
        *size = updated.max(0) as u64;
    }

    fn refresh_expiry(&self, key: &str, entry: &Arc<CacheEntry>) {
        let mut table = self.table.lock();
        if let Some(slot) = table.peek_mut(key) {
            if Arc::ptr_eq(&slot.entry, entry) {
                slot.expires_at = Instant::now() + self.config.ttl_with_jitter();
            }
        }
    }

    /// Retire a removed entry, wake its waiters, release its bytes
    fn teardown(&self, key: &str, entry: &CacheEntry, reason: InvalidationReason) -> u64 {
        let freed = entry.retire(reason.terminal_status());
        self.apply_size_delta(-(freed as i64));

        match reason {
            InvalidationReason::SizeLimit => self.metrics.record_size_eviction(),
            InvalidationReason::CapacityLimit => self.metrics.record_capacity_eviction(),
            InvalidationReason::Expired => self.metrics.record_expiration(),
            InvalidationReason::Manual | InvalidationReason::Cleared => {}
        }
        debug!(key, freed, %reason, "removed cache entry");
        freed
    }

    /// Start re-fetching a servable entry.
    ///
    /// Moves an `Exist` entry back to `Updating` so that lookups wait for the
    /// new value instead of fetching it themselves. Returns `false` when the
    /// key is absent or another fetch already owns it.
    pub fn begin_refresh(&self, key: &str) -> bool {
        let entry = self.table.lock().peek(key).map(|slot| Arc::clone(&slot.entry));
        let started = entry.is_some_and(|entry| entry.begin_update(true));
        if started {
            debug!(key, "refreshing cache entry");
        }
        started
    }

    /// Tell waiters of a pending entry that its fetch failed
    pub fn mark_failed(&self, key: &str) -> bool {
        let entry = self.table.lock().peek(key).map(|slot| Arc::clone(&slot.entry));
        entry.is_some_and(|entry| entry.fail())
    }

    /// Remove a single key
    pub fn remove(&self, key: &str) -> bool {
        let Some(slot) = self.table.lock().pop(key) else {
            return false;
        };
        self.teardown(key, &slot.entry, InvalidationReason::Manual);
        self.metrics.record_invalidations(1);
        true
    }

    /// Drop every entry; all waiters are woken with `Expired`
    pub fn clear(&self) -> InvalidationEvent {
        let drained: Vec<(CacheKey, Slot)> = {
            let mut table = self.table.lock();
            std::iter::from_fn(|| table.pop_lru()).collect()
        };

        let mut keys = Vec::with_capacity(drained.len());
        let mut freed = 0;
        for (key, slot) in drained {
            freed += self.teardown(&key, &slot.entry, InvalidationReason::Cleared);
            keys.push(key);
        }
        self.metrics.record_invalidations(keys.len() as u64);

        info!("Cleared {} entries from cache", keys.len());
        InvalidationEvent::new(InvalidationReason::Cleared, keys, freed)
    }

    /// Remove all entries past their TTL
    pub fn purge_expired(&self) -> InvalidationEvent {
        let now = Instant::now();
        let expired: Vec<(CacheKey, Slot)> = {
            let mut table = self.table.lock();
            let keys: Vec<CacheKey> = table
                .iter()
                .filter(|(_, slot)| slot.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| table.pop(&key).map(|slot| (key, slot)))
                .collect()
        };

        let mut keys = Vec::with_capacity(expired.len());
        let mut freed = 0;
        for (key, slot) in expired {
            freed += self.teardown(&key, &slot.entry, InvalidationReason::Expired);
            keys.push(key);
        }

        if !keys.is_empty() {
            debug!("Cleaned up {} expired entries", keys.len());
        }
        InvalidationEvent::new(InvalidationReason::Expired, keys, freed)
    }

    /// Whether a live entry exists, without touching recency
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.table
            .lock()
            .peek(key)
            .is_some_and(|slot| !slot.is_expired(now))
    }

    /// Number of entries in the table
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Tracked aggregate payload size
    pub fn size_bytes(&self) -> u64 {
        *self.size_bytes.lock()
    }

    /// Sum of entry sizes recomputed by walking the table.
    ///
    /// Equals [`size_bytes`](Self::size_bytes) whenever no store is in flight.
    pub fn computed_size_bytes(&self) -> u64 {
        let entries: Vec<Arc<CacheEntry>> = self
            .table
            .lock()
            .iter()
            .map(|(_, slot)| Arc::clone(&slot.entry))
            .collect();
        entries.iter().map(|entry| entry.size()).sum()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot(self.len(), self.size_bytes())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Admission counters backing this cache
    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }
}

/// Pop the least recently used slot other than `protect`
fn pop_victim(table: &mut LruCache<CacheKey, Slot>, protect: &str) -> Option<(CacheKey, Slot)> {
    let (key, slot) = table.pop_lru()?;
    if key != protect {
        return Some((key, slot));
    }
    let next = table.pop_lru();
    table.push(key, slot);
    next
}

impl std::fmt::Debug for BoundedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("max_entries", &self.config.max_entries)
            .field("max_memory_bytes", &self.config.max_memory_bytes)
            .field("ttl", &self.config.ttl)
            .field("min_uses", &self.config.min_uses)
            .field("current_entries", &self.len())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn never() -> std::future::Pending<()> {
        std::future::pending()
    }

    fn config() -> CacheConfig {
        CacheConfig::builder()
            .ttl(Duration::from_secs(60))
            .max_entries(100)
            .max_memory_bytes(1000)
            .max_entry_bytes(1000)
            .build()
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from(vec![b'x'; len])
    }

    #[tokio::test]
    async fn test_basic_set_and_get() {
        let cache = BoundedCache::new(config()).unwrap();

        let outcome = assert_ok!(cache.set("k", payload(10), Bytes::from_static(b"{}")));
        assert_eq!(outcome, StoreOutcome::Stored);

        let entry = cache.get("k").unwrap();
        assert_eq!(entry.status(), EntryStatus::Exist);
        assert_eq!(entry.size(), 12);
        assert_eq!(cache.size_bytes(), 12);
        assert_eq!(cache.computed_size_bytes(), 12);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let cache = BoundedCache::new(config()).unwrap();
        let result = cache.get_with_wait(never(), "missing", Duration::from_secs(1)).await;
        assert!(result.unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_admission_threshold() {
        let config = CacheConfig { min_uses: 2, ..config() };
        let cache = BoundedCache::new(config).unwrap();

        assert_eq!(cache.init_cache("k"), AdmitOutcome::BelowThreshold { uses: 1 });
        assert!(cache.get("k").is_none());

        // second observation reaches the threshold
        assert_eq!(cache.set("k", payload(5), Bytes::new()).unwrap(), StoreOutcome::Stored);
        assert!(cache.get("k").is_some());
    }

    #[tokio::test]
    async fn test_init_cache_creates_updating_entry() {
        let cache = BoundedCache::new(config()).unwrap();

        assert_eq!(cache.init_cache("k"), AdmitOutcome::Admitted);
        assert_eq!(cache.get("k").unwrap().status(), EntryStatus::Updating);
        assert_eq!(cache.init_cache("k"), AdmitOutcome::AlreadyPresent);
        assert_eq!(cache.size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_update_existing_tracks_delta() {
        let cache = BoundedCache::new(config()).unwrap();

        cache.set("k", payload(100), Bytes::new()).unwrap();
        cache.set("k", payload(300), Bytes::new()).unwrap();
        assert_eq!(cache.size_bytes(), 300);

        cache.set("k", payload(50), Bytes::new()).unwrap();
        assert_eq!(cache.size_bytes(), 50);
        assert_eq!(cache.computed_size_bytes(), 50);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_size_eviction_is_lru() {
        let cache = BoundedCache::new(config()).unwrap();

        cache.set("a", payload(400), Bytes::new()).unwrap();
        cache.set("b", payload(400), Bytes::new()).unwrap();
        // touch a so that b is least recently used
        assert!(cache.get("a").is_some());

        cache.set("c", payload(400), Bytes::new()).unwrap();

        assert!(cache.contains_key("a"));
        assert!(!cache.contains_key("b"));
        assert!(cache.contains_key("c"));
        assert_eq!(cache.size_bytes(), 800);
        assert_eq!(cache.stats().evictions_size, 1);
    }

    #[tokio::test]
    async fn test_value_larger_than_budget_is_rejected() {
        let cache = BoundedCache::new(config()).unwrap();
        cache.set("small", payload(10), Bytes::new()).unwrap();

        let err = assert_err!(cache.set("huge", payload(1001), Bytes::new()));
        assert!(matches!(
            err,
            CacheError::Capacity {
                reason: CapacityReason::ExceedsMemoryBudget,
                ..
            }
        ));
        // nothing was evicted for a value that can never fit
        assert!(cache.contains_key("small"));
        assert_eq!(cache.stats().capacity_rejections, 1);
    }

    #[tokio::test]
    async fn test_entry_limit_rejection() {
        let config = CacheConfig::builder().max_memory_bytes(1000).build();
        let cache = BoundedCache::new(config).unwrap();

        let err = cache.set("k", payload(101), Bytes::new()).unwrap_err();
        assert!(matches!(
            err,
            CacheError::Capacity {
                reason: CapacityReason::ExceedsEntryLimit,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_capacity_eviction() {
        let config = CacheConfig { max_entries: 2, ..config() };
        let cache = BoundedCache::new(config).unwrap();

        cache.set("a", payload(10), Bytes::new()).unwrap();
        cache.set("b", payload(10), Bytes::new()).unwrap();
        cache.set("c", payload(10), Bytes::new()).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_key("a"));
        assert_eq!(cache.size_bytes(), 20);
        assert_eq!(cache.stats().evictions_capacity, 1);
    }

    #[tokio::test]
    async fn test_coalesced_wait_receives_value() {
        let cache = BoundedCache::new(config()).unwrap();
        cache.init_cache("k");

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_with_wait(never(), "k", Duration::from_secs(5))
                    .await
            })
        };

        while cache.get("k").unwrap().subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        cache.set("k", Bytes::from_static(b"value"), Bytes::new()).unwrap();

        let snapshot = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(snapshot.status, EntryStatus::Exist);
        assert_eq!(snapshot.body, Bytes::from_static(b"value"));
        assert_eq!(cache.stats().coalesced_waits, 1);
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_entry_untouched() {
        let cache = BoundedCache::new(config()).unwrap();
        cache.init_cache("k");

        let err = cache
            .get_with_wait(never(), "k", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::CoalescingTimeout { .. }));

        let entry = cache.get("k").unwrap();
        assert_eq!(entry.status(), EntryStatus::Updating);
        assert_eq!(entry.subscriber_count(), 0);
        assert_eq!(cache.stats().wait_timeouts, 1);
    }

    #[tokio::test]
    async fn test_mark_failed_wakes_waiters_with_stale_notification() {
        let cache = BoundedCache::new(config()).unwrap();
        cache.init_cache("k");

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_with_wait(never(), "k", Duration::from_secs(5))
                    .await
            })
        };
        while cache.get("k").unwrap().subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(cache.mark_failed("k"));
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            CacheError::StaleNotification {
                state: EntryStatus::Failed,
                ..
            }
        ));

        // a later admission starts a new generation
        assert_eq!(cache.init_cache("k"), AdmitOutcome::Admitted);
        assert_eq!(cache.get("k").unwrap().status(), EntryStatus::Updating);
    }

    #[tokio::test]
    async fn test_refresh_makes_lookups_wait_for_new_value() {
        let cache = BoundedCache::new(config()).unwrap();
        assert!(!cache.begin_refresh("k"));

        cache.set("k", Bytes::from_static(b"old"), Bytes::new()).unwrap();
        assert!(cache.begin_refresh("k"));
        assert!(!cache.begin_refresh("k"));
        assert_eq!(cache.get("k").unwrap().status(), EntryStatus::Updating);

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_with_wait(never(), "k", Duration::from_secs(5))
                    .await
            })
        };
        while cache.get("k").unwrap().subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        cache.set("k", Bytes::from_static(b"fresh"), Bytes::new()).unwrap();
        let snapshot = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(snapshot.body, Bytes::from_static(b"fresh"));
        assert_eq!(cache.size_bytes(), 5);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let config = CacheConfig {
            ttl: Duration::from_millis(50),
            ..config()
        };
        let cache = BoundedCache::new(config).unwrap();

        cache.set("k", payload(10), Bytes::new()).unwrap();
        assert!(cache.get("k").is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(cache.get("k").is_none());
        assert_eq!(cache.size_bytes(), 0);
        assert_eq!(cache.stats().evictions_ttl, 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let config = CacheConfig {
            ttl: Duration::from_millis(30),
            ..config()
        };
        let cache = BoundedCache::new(config).unwrap();

        cache.set("a", payload(10), Bytes::new()).unwrap();
        cache.set("b", payload(20), Bytes::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let event = cache.purge_expired();
        assert_eq!(event.keys.len(), 2);
        assert_eq!(event.freed_bytes, 30);
        assert!(cache.is_empty());
        assert_eq!(cache.size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let cache = BoundedCache::new(config()).unwrap();

        cache.set("a", payload(10), Bytes::new()).unwrap();
        cache.set("b", payload(10), Bytes::new()).unwrap();
        cache.init_cache("c");

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert_eq!(cache.size_bytes(), 10);

        let event = cache.clear();
        assert_eq!(event.keys.len(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.size_bytes(), 0);
        assert_eq!(cache.stats().invalidations, 3);
    }

    #[test]
    fn test_pop_victim_skips_protected_key() {
        let mut table: LruCache<CacheKey, Slot> = LruCache::new(NonZeroUsize::new(4).unwrap());
        let slot = |key: &str| Slot {
            entry: Arc::new(CacheEntry::new(key)),
            expires_at: Instant::now() + Duration::from_secs(60),
        };
        table.push("a".to_string(), slot("a"));
        table.push("b".to_string(), slot("b"));

        let (victim, _) = pop_victim(&mut table, "a").unwrap();
        assert_eq!(victim, "b");
        assert!(table.contains("a"));
        assert!(pop_victim(&mut table, "a").is_none());
        assert!(table.contains("a"));
    }
}
