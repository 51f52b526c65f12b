//! Cache entry state machine with broadcast wake-ups
//!
//! An entry carries one cached response plus the set of requests blocked
//! waiting for it to become servable. Status, payload, and subscribers sit
//! behind a single lock so that registering a waiter, re-checking status,
//! and broadcasting a transition can never interleave.

use crate::cache::types::{CacheKey, EntryStatus};
use crate::error::{CacheError, Result};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Servable contents of an entry at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub status: EntryStatus,
    pub body: Bytes,
    pub headers: Bytes,
}

impl EntrySnapshot {
    /// Payload size in bytes
    pub fn size(&self) -> u64 {
        (self.body.len() + self.headers.len()) as u64
    }
}

/// One cached artifact and the waiters parked on it
pub struct CacheEntry {
    key: CacheKey,
    state: Mutex<EntryState>,
    /// Serialises payload replacement for this key; never taken by eviction
    write_lock: Mutex<()>,
}

struct EntryState {
    body: Bytes,
    headers: Bytes,
    status: EntryStatus,
    subscribers: HashMap<u64, oneshot::Sender<EntryStatus>>,
    last_subscriber_id: u64,
    /// Set once the entry has left the table; no further transitions
    retired: bool,
}

impl EntryState {
    fn size(&self) -> u64 {
        (self.body.len() + self.headers.len()) as u64
    }

    /// Deliver `status` to every registered waiter and retire their subscriptions
    fn broadcast(&mut self, status: EntryStatus) -> usize {
        let waiters = self.subscribers.len();
        for (_, sender) in self.subscribers.drain() {
            // A receiver dropped mid-broadcast just misses the value.
            let _ = sender.send(status);
        }
        waiters
    }
}

impl CacheEntry {
    /// Create an empty entry in `Initializing`
    pub fn new(key: impl Into<CacheKey>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(EntryState {
                body: Bytes::new(),
                headers: Bytes::new(),
                status: EntryStatus::Initializing,
                subscribers: HashMap::new(),
                last_subscriber_id: 0,
                retired: false,
            }),
            write_lock: Mutex::new(()),
        }
    }

    /// Create an entry whose origin fetch has already started
    pub fn new_updating(key: impl Into<CacheKey>) -> Self {
        let entry = Self::new(key);
        entry.state.lock().status = EntryStatus::Updating;
        entry
    }

    /// Create an already populated entry
    pub fn with_payload(key: impl Into<CacheKey>, body: Bytes, headers: Bytes) -> Self {
        let entry = Self::new(key);
        {
            let mut state = entry.state.lock();
            state.body = body;
            state.headers = headers;
            state.status = EntryStatus::Exist;
        }
        entry
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> EntryStatus {
        self.state.lock().status
    }

    /// `len(body) + len(headers)`
    pub fn size(&self) -> u64 {
        self.state.lock().size()
    }

    /// Whether the entry has been removed from its cache
    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        let state = self.state.lock();
        EntrySnapshot {
            status: state.status,
            body: state.body.clone(),
            headers: state.headers.clone(),
        }
    }

    /// Number of currently blocked waiters
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Publish `status` to every waiter registered right now
    ///
    /// Waiters registering afterwards do not see this value; they observe the
    /// entry's status directly when they register.
    pub fn notify_subscribers(&self, status: EntryStatus) -> usize {
        self.state.lock().broadcast(status)
    }

    /// Block until the entry leaves its pending state, the caller cancels, or
    /// `timeout` elapses.
    ///
    /// If the entry is no longer pending when the subscription is taken, its
    /// current status is returned at once. The subscription is removed on
    /// every exit path, including the returned future being dropped.
    pub async fn wait_for_state_change<C>(&self, cancel: C, timeout: Duration) -> Result<EntryStatus>
    where
        C: Future<Output = ()>,
    {
        let mut subscription = match self.subscribe() {
            Ok(subscription) => subscription,
            Err(status) => return Ok(status),
        };

        trace!(key = %self.key, id = subscription.id, "waiting for state change");

        tokio::select! {
            biased;
            received = &mut subscription.receiver => {
                // A dropped sender means the entry was torn down without a broadcast.
                Ok(received.unwrap_or(EntryStatus::Expired))
            }
            _ = cancel => Err(CacheError::CoalescingCancelled { key: self.key.clone() }),
            _ = tokio::time::sleep(timeout) => Err(CacheError::CoalescingTimeout {
                key: self.key.clone(),
                timeout_ms: saturating_millis(timeout),
            }),
        }
    }

    /// Register a waiter, or report the status if there is nothing to wait for
    fn subscribe(&self) -> std::result::Result<Subscription<'_>, EntryStatus> {
        let mut state = self.state.lock();
        if !state.status.is_pending() || state.retired {
            return Err(state.status);
        }

        state.last_subscriber_id += 1;
        let id = state.last_subscriber_id;
        let (sender, receiver) = oneshot::channel();
        state.subscribers.insert(id, sender);

        Ok(Subscription {
            entry: self,
            id,
            receiver,
        })
    }

    fn unsubscribe(&self, id: u64) {
        self.state.lock().subscribers.remove(&id);
    }

    /// Start a new fetch generation
    ///
    /// Moves `Initializing`, `Failed`, or a non-retired `Expired` entry to
    /// `Updating`. A servable `Exist` entry is refreshed only when `refresh`
    /// is set. Returns whether this call started the generation; an entry
    /// already `Updating` belongs to someone else's fetch.
    pub(crate) fn begin_update(&self, refresh: bool) -> bool {
        let mut state = self.state.lock();
        if state.retired {
            return false;
        }
        match state.status {
            EntryStatus::Updating => false,
            EntryStatus::Exist if !refresh => false,
            _ => {
                state.status = EntryStatus::Updating;
                true
            }
        }
    }

    /// Hold the per-key write lock for the duration of a store
    pub(crate) fn lock_for_write(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// Swap in a new payload, mark `Exist`, and wake all waiters.
    ///
    /// Returns the size difference applied, or `None` if the entry was
    /// retired in the meantime and nothing changed.
    pub(crate) fn replace_payload(&self, body: Bytes, headers: Bytes) -> Option<i64> {
        let mut state = self.state.lock();
        if state.retired {
            return None;
        }
        let old_size = state.size() as i64;
        state.body = body;
        state.headers = headers;
        state.status = EntryStatus::Exist;
        let delta = state.size() as i64 - old_size;
        let woken = state.broadcast(EntryStatus::Exist);
        debug!(key = %self.key, woken, delta, "cache entry populated");
        Some(delta)
    }

    /// Move a pending entry to `Failed` and wake its waiters
    pub(crate) fn fail(&self) -> bool {
        let mut state = self.state.lock();
        if state.retired || !state.status.is_pending() {
            return false;
        }
        state.status = EntryStatus::Failed;
        let woken = state.broadcast(EntryStatus::Failed);
        debug!(key = %self.key, woken, "cache entry fetch failed");
        true
    }

    /// Final teardown when the entry leaves the table.
    ///
    /// Releases the payload, wakes every waiter with `status`, and returns the
    /// bytes freed. Idempotent: a second call frees nothing.
    pub(crate) fn retire(&self, status: EntryStatus) -> u64 {
        let mut state = self.state.lock();
        if state.retired {
            return 0;
        }
        let freed = state.size();
        state.retired = true;
        state.status = status;
        state.body = Bytes::new();
        state.headers = Bytes::new();
        state.broadcast(status);
        freed
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("status", &state.status)
            .field("size", &state.size())
            .field("subscribers", &state.subscribers.len())
            .field("retired", &state.retired)
            .finish()
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A registered waiter; deregisters itself on drop
struct Subscription<'a> {
    entry: &'a CacheEntry,
    id: u64,
    receiver: oneshot::Receiver<EntryStatus>,
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.entry.unsubscribe(self.id);
    }
}
