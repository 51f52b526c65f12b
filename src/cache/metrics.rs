//! Lock-free counters behind [`CacheStats`]

use crate::cache::types::CacheStats;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated from any thread without touching the cache locks
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced_waits: AtomicU64,
    wait_timeouts: AtomicU64,
    wait_cancellations: AtomicU64,
    admissions: AtomicU64,
    admission_rejections: AtomicU64,
    stores: AtomicU64,
    capacity_rejections: AtomicU64,
    evictions_size: AtomicU64,
    evictions_capacity: AtomicU64,
    evictions_ttl: AtomicU64,
    invalidations: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_hit, hits);
    counter!(record_miss, misses);
    counter!(record_coalesced_wait, coalesced_waits);
    counter!(record_wait_timeout, wait_timeouts);
    counter!(record_wait_cancellation, wait_cancellations);
    counter!(record_admission, admissions);
    counter!(record_admission_rejection, admission_rejections);
    counter!(record_store, stores);
    counter!(record_capacity_rejection, capacity_rejections);
    counter!(record_size_eviction, evictions_size);
    counter!(record_capacity_eviction, evictions_capacity);
    counter!(record_expiration, evictions_ttl);

    /// Record `count` explicit invalidations at once
    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Build a snapshot; entry count and size come from the cache itself
    pub fn snapshot(&self, entries: usize, size_bytes: u64) -> CacheStats {
        CacheStats {
            hits: self.hits(),
            misses: self.misses(),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            wait_cancellations: self.wait_cancellations.load(Ordering::Relaxed),
            admissions: self.admissions.load(Ordering::Relaxed),
            admission_rejections: self.admission_rejections.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            capacity_rejections: self.capacity_rejections.load(Ordering::Relaxed),
            evictions_size: self.evictions_size.load(Ordering::Relaxed),
            evictions_capacity: self.evictions_capacity.load(Ordering::Relaxed),
            evictions_ttl: self.evictions_ttl.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries,
            size_bytes,
            taken_at: Utc::now(),
        }
    }
}
