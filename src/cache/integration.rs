//! Request-facing cache facade
//!
//! `QueryCache` is what an HTTP layer in front of the query API talks to:
//!
//! 1. [`derive_key`](QueryCache::derive_key) turns a request into a key,
//! 2. [`lookup`](QueryCache::lookup) serves a hit or coalesces with an
//!    in-flight fetch,
//! 3. on a miss, [`try_admit`](QueryCache::try_admit) claims the fetch,
//!    and [`store_response`](QueryCache::store_response) or
//!    [`abandon`](QueryCache::abandon) settles it.

use crate::cache::{
    config::CacheConfig,
    invalidation::InvalidationEvent,
    store::BoundedCache,
    types::{AdmitOutcome, CacheStats, EntryStatus, StoreOutcome},
};
use crate::error::Result;
use crate::key::{BucketConfig, CacheKeyDeriver, DerivedKey, QueryRequest};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Serialized form of a response header set
pub type ResponseHeaders = BTreeMap<String, Vec<String>>;

/// A servable cached response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub body: Bytes,

    /// JSON encoded [`ResponseHeaders`]
    pub raw_headers: Bytes,
}

impl CachedResponse {
    /// Decode the stored header set; an empty payload means no headers
    pub fn headers(&self) -> Result<ResponseHeaders> {
        if self.raw_headers.is_empty() {
            return Ok(ResponseHeaders::new());
        }
        Ok(serde_json::from_slice(&self.raw_headers)?)
    }
}

/// Query response cache shared by all request workers
#[derive(Clone)]
pub struct QueryCache {
    cache: Arc<BoundedCache>,
    deriver: CacheKeyDeriver,
}

impl QueryCache {
    /// Create a cache with the default bucket widths
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_buckets(config, BucketConfig::default())
    }

    pub fn with_buckets(config: CacheConfig, buckets: BucketConfig) -> Result<Self> {
        Ok(Self {
            cache: BoundedCache::new(config)?,
            deriver: CacheKeyDeriver::new(buckets)?,
        })
    }

    /// Get the underlying cache instance
    pub fn inner(&self) -> Arc<BoundedCache> {
        Arc::clone(&self.cache)
    }

    /// Derive the cache key and data source ids of a request
    pub fn derive_key(&self, request: &QueryRequest) -> Result<DerivedKey> {
        Ok(self.deriver.derive(request)?)
    }

    /// Same as [`derive_key`](Self::derive_key) for a raw JSON body
    pub fn derive_key_from_slice(&self, body: &[u8]) -> Result<DerivedKey> {
        Ok(self.deriver.derive_from_slice(body)?)
    }

    /// Record a request for `key` and claim its origin fetch if it is hot enough
    pub fn try_admit(&self, key: &str) -> AdmitOutcome {
        self.cache.init_cache(key)
    }

    /// Coalesced read with the configured wait timeout
    pub async fn lookup<C>(&self, key: &str, cancel: C) -> Result<Option<CachedResponse>>
    where
        C: Future<Output = ()>,
    {
        self.lookup_with_timeout(key, cancel, self.cache.config().wait_timeout)
            .await
    }

    /// Coalesced read.
    ///
    /// `Ok(None)` is a miss, including entries whose last fetch failed or
    /// that were evicted while being waited on.
    pub async fn lookup_with_timeout<C>(
        &self,
        key: &str,
        cancel: C,
        timeout: Duration,
    ) -> Result<Option<CachedResponse>>
    where
        C: Future<Output = ()>,
    {
        let snapshot = self.cache.get_with_wait(cancel, key, timeout).await?;
        Ok(snapshot
            .filter(|snapshot| snapshot.status == EntryStatus::Exist)
            .map(|snapshot| CachedResponse {
                body: snapshot.body,
                raw_headers: snapshot.headers,
            }))
    }

    /// Store a response with an already serialized header set
    pub fn store(
        &self,
        key: &str,
        body: impl Into<Bytes>,
        headers: impl Into<Bytes>,
    ) -> Result<StoreOutcome> {
        self.cache.set(key, body.into(), headers.into())
    }

    /// Store a response, serializing its header set
    pub fn store_response(
        &self,
        key: &str,
        body: impl Into<Bytes>,
        headers: &ResponseHeaders,
    ) -> Result<StoreOutcome> {
        let raw_headers = serde_json::to_vec(headers)?;
        self.store(key, body, raw_headers)
    }

    /// Claim a re-fetch of a servable key; lookups coalesce on it until stored
    pub fn try_refresh(&self, key: &str) -> bool {
        self.cache.begin_refresh(key)
    }

    /// Give up a claimed fetch; waiters fall back to the origin at once
    pub fn abandon(&self, key: &str) -> bool {
        self.cache.mark_failed(key)
    }

    /// Drop every entry and unblock all waiters
    pub fn clear(&self) -> InvalidationEvent {
        self.cache.clear()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("cache", &self.cache)
            .field("buckets", self.deriver.buckets())
            .finish()
    }
}
