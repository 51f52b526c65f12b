//! Core type definitions for the cache system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cache key type - produced by [`crate::key::CacheKeyDeriver`]
pub type CacheKey = String;

/// Lifecycle state of a cached artifact
///
/// `Initializing -> Updating -> Exist`, `Exist -> Updating` on refresh.
/// `Failed` and `Expired` end a generation; re-admitting the key starts a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Row exists but holds no usable bytes
    Initializing,
    /// Populated and servable
    Exist,
    /// An origin fetch is in flight
    Updating,
    /// Removed by TTL, eviction, or clear
    Expired,
    /// The origin fetch did not produce a value
    Failed,
}

impl EntryStatus {
    /// Waiters should block on this state rather than fetch
    pub fn is_pending(self) -> bool {
        matches!(self, EntryStatus::Initializing | EntryStatus::Updating)
    }

    /// Ends the current generation
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Expired | EntryStatus::Failed)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryStatus::Initializing => write!(f, "initializing"),
            EntryStatus::Exist => write!(f, "exist"),
            EntryStatus::Updating => write!(f, "updating"),
            EntryStatus::Expired => write!(f, "expired"),
            EntryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// The key is now `Updating` and the caller owns the origin fetch
    Admitted,
    /// An entry already exists for the key and was left untouched
    AlreadyPresent,
    /// Usage count is still below `min_uses`
    BelowThreshold { uses: u64 },
}

/// Result of a store attempt that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The value is cached and waiters were notified
    Stored,
    /// Usage count is still below `min_uses`; nothing was written
    BelowThreshold { uses: u64 },
}

/// Snapshot of cache counters for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered with a servable value
    pub hits: u64,

    /// Lookups that found nothing servable
    pub misses: u64,

    /// Lookups that blocked on another request's fetch
    pub coalesced_waits: u64,

    /// Waits that ran out of time
    pub wait_timeouts: u64,

    /// Waits cancelled by the caller
    pub wait_cancellations: u64,

    /// Keys that passed the usage threshold and got an entry
    pub admissions: u64,

    /// Admission or store attempts below the usage threshold
    pub admission_rejections: u64,

    /// Successful stores
    pub stores: u64,

    /// Stores refused by memory limits
    pub capacity_rejections: u64,

    /// Entries evicted to respect the memory budget
    pub evictions_size: u64,

    /// Entries evicted to respect the entry-count limit
    pub evictions_capacity: u64,

    /// Entries dropped by TTL
    pub evictions_ttl: u64,

    /// Entries removed by explicit invalidation or clear
    pub invalidations: u64,

    /// Number of live entries
    pub entries: usize,

    /// Tracked payload bytes of all live entries
    pub size_bytes: u64,

    /// When this snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl CacheStats {
    /// Cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Total evictions of any kind except explicit invalidation
    pub fn total_evictions(&self) -> u64 {
        self.evictions_size + self.evictions_capacity + self.evictions_ttl
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, coalesced: {}, entries: {}, size: {} bytes, evictions: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.coalesced_waits,
            self.entries,
            self.size_bytes,
            self.total_evictions()
        )
    }
}
