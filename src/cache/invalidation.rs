//! Reasons an entry leaves the table, and the events reporting it
//!
//! Whatever the reason, removal funnels through the same teardown: the
//! entry is retired, its waiters are told `Expired`, and its bytes are
//! subtracted from the tracked size.

use crate::cache::types::{CacheKey, EntryStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason for removing an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// Entry outlived its TTL
    Expired,

    /// Evicted as least recently used to respect the memory budget
    SizeLimit,

    /// Evicted as least recently used to respect the entry-count limit
    CapacityLimit,

    /// Manual invalidation of a single key
    Manual,

    /// Administrative clear of the whole cache
    Cleared,
}

impl InvalidationReason {
    /// State broadcast to waiters of a removed entry
    pub fn terminal_status(self) -> EntryStatus {
        EntryStatus::Expired
    }
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Expired => write!(f, "TTL expired"),
            InvalidationReason::SizeLimit => write!(f, "memory budget reached"),
            InvalidationReason::CapacityLimit => write!(f, "entry limit reached"),
            InvalidationReason::Manual => write!(f, "manual invalidation"),
            InvalidationReason::Cleared => write!(f, "cache cleared"),
        }
    }
}

/// Event describing a batch removal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Reason for invalidation
    pub reason: InvalidationReason,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Keys that were invalidated
    pub keys: Vec<CacheKey>,

    /// Bytes released by the removal
    pub freed_bytes: u64,
}

impl InvalidationEvent {
    /// Create a new invalidation event
    pub fn new(reason: InvalidationReason, keys: Vec<CacheKey>, freed_bytes: u64) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            keys,
            freed_bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
