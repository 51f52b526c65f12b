//! Cache key derivation from query request semantics
//!
//! A key is made of the coarse position of the requested window, the coarse
//! length of that window, and a content hash of the query list:
//!
//! ```text
//! time_bucket=<to / 30min>;range_bucket=<(to - from) / 10min>;queries_hash=<sha256>
//! ```
//!
//! Requests whose window shifts by less than a bucket width therefore share
//! a cache entry even though their timestamps differ.

use crate::error::{self, CacheError, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Bucket widths used to coarsen request timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Width of the `to` timestamp bucket in milliseconds
    pub time_bucket_ms: i64,

    /// Width of the `to - from` range bucket in milliseconds
    pub range_bucket_ms: i64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            time_bucket_ms: Duration::from_secs(30 * 60).as_millis() as i64,
            range_bucket_ms: Duration::from_secs(10 * 60).as_millis() as i64,
        }
    }
}

impl BucketConfig {
    /// Both widths must be positive
    pub fn validate(&self) -> error::Result<()> {
        if self.time_bucket_ms <= 0 {
            return Err(CacheError::Config(format!(
                "time_bucket_ms must be greater than 0, got {}",
                self.time_bucket_ms
            )));
        }
        if self.range_bucket_ms <= 0 {
            return Err(CacheError::Config(format!(
                "range_bucket_ms must be greater than 0, got {}",
                self.range_bucket_ms
            )));
        }
        Ok(())
    }
}

/// Query request body as posted by the dashboard frontend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// End of the window, epoch milliseconds as a decimal string
    #[serde(default)]
    pub to: String,

    /// Start of the window, epoch milliseconds as a decimal string
    #[serde(default)]
    pub from: String,

    /// Opaque sub-queries; each names its data source under `datasource.uid`
    #[serde(default)]
    pub queries: Vec<Value>,
}

impl QueryRequest {
    pub fn new(to: impl Into<String>, from: impl Into<String>, queries: Vec<Value>) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            queries,
        }
    }
}

/// Result of key derivation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedKey {
    pub cache_key: String,

    /// Data source uids in query order, for access checks by the caller
    pub data_source_ids: Vec<String>,
}

/// Maps query requests to cache keys
#[derive(Debug, Clone, Default)]
pub struct CacheKeyDeriver {
    buckets: BucketConfig,
}

impl CacheKeyDeriver {
    /// Create a deriver with custom bucket widths
    pub fn new(buckets: BucketConfig) -> error::Result<Self> {
        buckets.validate()?;
        Ok(Self { buckets })
    }

    pub fn buckets(&self) -> &BucketConfig {
        &self.buckets
    }

    /// Parse a raw JSON request body and derive its key
    pub fn derive_from_slice(&self, body: &[u8]) -> Result<DerivedKey, ValidationError> {
        let request: QueryRequest = serde_json::from_slice(body)
            .map_err(|e| ValidationError::MalformedBody(e.to_string()))?;
        self.derive(&request)
    }

    /// Derive the cache key and data source ids of `request`.
    ///
    /// Pure: the same request always yields the same key.
    pub fn derive(&self, request: &QueryRequest) -> Result<DerivedKey, ValidationError> {
        if request.to.is_empty() {
            return Err(ValidationError::MissingField("to"));
        }
        if request.from.is_empty() {
            return Err(ValidationError::MissingField("from"));
        }
        if request.queries.is_empty() {
            return Err(ValidationError::EmptyQueries);
        }

        let data_source_ids = extract_data_source_ids(&request.queries)?;

        let to = parse_timestamp("to", &request.to)?;
        let from = parse_timestamp("from", &request.from)?;

        let time_bucket = to.div_euclid(self.buckets.time_bucket_ms);
        let range_bucket = to
            .checked_sub(from)
            .ok_or(ValidationError::InvalidRange { to, from })?
            .div_euclid(self.buckets.range_bucket_ms);
        let queries_hash = hash_queries(&request.queries)?;

        Ok(DerivedKey {
            cache_key: format!(
                "time_bucket={};range_bucket={};queries_hash={}",
                time_bucket, range_bucket, queries_hash
            ),
            data_source_ids,
        })
    }
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<i64, ValidationError> {
    value
        .parse::<i64>()
        .map_err(|_| ValidationError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

fn extract_data_source_ids(queries: &[Value]) -> Result<Vec<String>, ValidationError> {
    queries
        .iter()
        .enumerate()
        .map(|(index, query)| {
            query
                .pointer("/datasource/uid")
                .and_then(Value::as_str)
                .filter(|uid| !uid.is_empty())
                .map(str::to_string)
                .ok_or(ValidationError::MissingDataSource { index })
        })
        .collect()
}

/// SHA-256 of the canonical JSON of the query list, hex encoded
fn hash_queries(queries: &[Value]) -> Result<String, ValidationError> {
    // serde_json::Value keeps object keys sorted, so field order in the
    // request does not change the hash.
    let canonical =
        serde_json::to_vec(queries).map_err(|e| ValidationError::MalformedBody(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}
