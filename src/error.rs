//! Error types for cache operations
//!
//! Every error here is recoverable: the caller serves the request from the
//! origin and, at worst, skips writing the response back into the cache.

use crate::cache::types::EntryStatus;
use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// The inbound request could not be turned into a cache key
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A waiter gave up before the populating request finished
    #[error("Timed out after {timeout_ms}ms waiting for cache key {key}")]
    CoalescingTimeout { key: String, timeout_ms: u64 },

    /// The waiter's cancellation signal fired first
    #[error("Wait for cache key {key} was cancelled")]
    CoalescingCancelled { key: String },

    /// The value cannot be held within the configured memory limits
    #[error("Cannot cache {size_bytes} bytes ({reason}, limit {limit_bytes} bytes)")]
    Capacity {
        size_bytes: u64,
        limit_bytes: u64,
        reason: CapacityReason,
    },

    /// A waiter woke up to a state other than `Exist`
    #[error("Cache key {key} resolved to non-servable state {state}")]
    StaleNotification { key: String, state: EntryStatus },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Why a value was refused by the memory accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityReason {
    /// Larger than the whole memory budget
    ExceedsMemoryBudget,
    /// Larger than the per-entry limit
    ExceedsEntryLimit,
    /// Every other entry was evicted and it still does not fit
    BudgetExhausted,
}

impl std::fmt::Display for CapacityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityReason::ExceedsMemoryBudget => write!(f, "exceeds memory budget"),
            CapacityReason::ExceedsEntryLimit => write!(f, "exceeds per-entry limit"),
            CapacityReason::BudgetExhausted => write!(f, "cache drained, still insufficient"),
        }
    }
}

/// Malformed request fields found while deriving a cache key
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Request body is not the expected JSON document
    #[error("malformed request body: {0}")]
    MalformedBody(String),

    /// A required field is absent or empty
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// `to` or `from` is not a decimal integer
    #[error("invalid `{field}` timestamp {value:?}")]
    InvalidTimestamp { field: &'static str, value: String },

    /// `to - from` does not fit a 64-bit millisecond span
    #[error("time range from {from} to {to} is out of bounds")]
    InvalidRange { to: i64, from: i64 },

    /// The query list is empty
    #[error("request contains no queries")]
    EmptyQueries,

    /// A query has no data source uid
    #[error("query #{index} has no datasource uid")]
    MissingDataSource { index: usize },
}

impl CacheError {
    /// Whether the caller should simply fetch from the origin itself
    ///
    /// Coalescing failures are not faults of the request; validation and
    /// capacity failures mean the response must not be cached at all.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::CoalescingTimeout { .. }
                | CacheError::CoalescingCancelled { .. }
                | CacheError::StaleNotification { .. }
        )
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
