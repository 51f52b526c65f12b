//! Per-key usage counting for admission control
//!
//! Only keys requested at least `min_uses` times earn a cache slot. Counters
//! idle for longer than the retention window are forgotten, so a key has to
//! become hot again before it is re-admitted.

use crate::cache::background::BackgroundTask;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Usage counter of a single key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecord {
    pub uses: u64,
    pub last_used: Instant,
}

struct UsageTable {
    records: Mutex<HashMap<String, UsageRecord>>,
    retention: Duration,
}

impl UsageTable {
    fn is_stale(&self, record: &UsageRecord, now: Instant) -> bool {
        now.saturating_duration_since(record.last_used) > self.retention
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| !self.is_stale(record, now));
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, remaining = records.len(), "swept idle usage counters");
        }
        removed
    }
}

/// Thread-safe hit counter with time-based expiry
pub struct UsageTracker {
    table: Arc<UsageTable>,
    _sweeper: Option<BackgroundTask>,
}

impl UsageTracker {
    /// Create a tracker and start its periodic sweep on the current runtime.
    ///
    /// A zero `sweep_interval` is raised to the shortest supported period.
    pub fn new(retention: Duration, sweep_interval: Duration) -> Self {
        let table = Arc::new(UsageTable {
            records: Mutex::new(HashMap::new()),
            retention,
        });
        let sweeper = BackgroundTask::spawn_periodic(
            "usage-sweep",
            sweep_interval,
            Arc::downgrade(&table),
            |table: &UsageTable| {
                table.sweep();
            },
        );

        Self {
            table,
            _sweeper: sweeper,
        }
    }

    /// Increment the counter for `key` and return the post-increment value.
    ///
    /// A counter idle beyond the retention window starts again from 1 even if
    /// the sweep has not reached it yet.
    pub fn record_usage(&self, key: &str) -> u64 {
        let now = Instant::now();
        let mut records = self.table.records.lock();
        let record = records.entry(key.to_string()).or_insert(UsageRecord {
            uses: 0,
            last_used: now,
        });
        if self.table.is_stale(record, now) {
            record.uses = 0;
        }
        record.uses += 1;
        record.last_used = now;
        record.uses
    }

    /// Current counter for `key` without touching `last_used`; 0 if unknown
    pub fn get_uses(&self, key: &str) -> u64 {
        let now = Instant::now();
        self.table
            .records
            .lock()
            .get(key)
            .filter(|record| !self.table.is_stale(record, now))
            .map_or(0, |record| record.uses)
    }

    /// Remove every counter idle beyond the retention window
    pub fn sweep(&self) -> usize {
        self.table.sweep()
    }

    /// Number of tracked keys, including not-yet-swept idle ones
    pub fn len(&self) -> usize {
        self.table.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn retention(&self) -> Duration {
        self.table.retention
    }
}

impl std::fmt::Debug for UsageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageTracker")
            .field("retention", &self.table.retention)
            .field("tracked_keys", &self.len())
            .field("sweeping", &self._sweeper.is_some())
            .finish()
    }
}
