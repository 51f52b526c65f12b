//! # Query Response Cache (query-response-cache)
//!
//! A caching layer for a time-series query API. Requests are keyed by their
//! semantic content (coarse time window plus query set), hot keys are served
//! from memory, and concurrent identical requests share a single origin
//! fetch.
//!
//! ## Request Flow
//!
//! ```no_run
//! use query_response_cache::{AdmitOutcome, CacheConfig, QueryCache};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = QueryCache::new(CacheConfig::from_env()?)?;
//!
//!     let body = br#"{"from":"1699996400000","to":"1700000000000",
//!                     "queries":[{"refId":"A","datasource":{"uid":"prom-1"},"expr":"up"}]}"#;
//!     let derived = cache.derive_key_from_slice(body)?;
//!     // check access to derived.data_source_ids here
//!
//!     if let Some(response) = cache.lookup(&derived.cache_key, std::future::pending()).await? {
//!         println!("serving {} cached bytes", response.body.len());
//!         return Ok(());
//!     }
//!
//!     let admitted = cache.try_admit(&derived.cache_key) == AdmitOutcome::Admitted;
//!     let fetched = "origin response";
//!     if admitted {
//!         cache.store(&derived.cache_key, fetched, "{}")?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Failure Handling
//!
//! Every [`CacheError`] is recoverable. Validation failures mean the request
//! is served from the origin and never cached; coalescing failures
//! ([`CacheError::is_retryable`]) mean the caller fetches the origin itself;
//! capacity failures mean the response is served uncached.

pub mod cache;
pub mod error;
pub mod key;

// Re-export main types for convenience
pub use cache::{
    AdmitOutcome, BoundedCache, CacheConfig, CacheConfigBuilder, CacheEntry, CacheKey,
    CacheStats, CachedResponse, EntrySnapshot, EntryStatus, InvalidationEvent,
    InvalidationReason, QueryCache, ResponseHeaders, StoreOutcome, UsageTracker,
};
pub use error::{CacheError, CapacityReason, Result, ValidationError};
pub use key::{BucketConfig, CacheKeyDeriver, DerivedKey, QueryRequest};
