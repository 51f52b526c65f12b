//! # Query Response Cache
//!
//! In-memory, memory-bounded cache for query API responses with request
//! coalescing.
//!
//! ## Features
//!
//! - **Request Coalescing**: concurrent requests for a key that is being
//!   fetched wait for that fetch instead of hitting the origin again
//! - **Admission Control**: only keys requested `min_uses` times get a slot
//! - **Memory Budget**: tracked byte size with least recently used eviction
//! - **TTL Expiration**: lazy on lookup plus a periodic background purge
//! - **Owned Maintenance**: background tasks stop when the cache is dropped
//!
//! ## Example
//!
//! ```rust
//! use query_response_cache::cache::{AdmitOutcome, CacheConfig, QueryCache};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CacheConfig::builder()
//!     .ttl(Duration::from_secs(3600))
//!     .max_entries(1_000)
//!     .max_memory_bytes(10 * 1024 * 1024)
//!     .min_uses(2)
//!     .build();
//!
//! let cache = QueryCache::new(config)?;
//! let key = "time_bucket=1;range_bucket=6;queries_hash=abc";
//!
//! match cache.lookup(key, std::future::pending()).await? {
//!     Some(response) => println!("Cache hit: {} bytes", response.body.len()),
//!     None => {
//!         if cache.try_admit(key) == AdmitOutcome::Admitted {
//!             // fetch from the origin, then
//!             cache.store(key, "response body", "{}")?;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod config;
pub mod entry;
pub mod integration;
pub mod invalidation;
pub mod metrics;
pub mod store;
pub mod types;
pub mod usage;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::{CacheEntry, EntrySnapshot};
pub use integration::{CachedResponse, QueryCache, ResponseHeaders};
pub use invalidation::{InvalidationEvent, InvalidationReason};
pub use metrics::CacheMetrics;
pub use store::BoundedCache;
pub use types::{AdmitOutcome, CacheKey, CacheStats, EntryStatus, StoreOutcome};
pub use usage::{UsageRecord, UsageTracker};
