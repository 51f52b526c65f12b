//! Simulates a burst of identical dashboard queries hitting the cache.
//!
//! Run with `RUST_LOG=query_response_cache=debug` to see every cache step.

use anyhow::Result;
use query_response_cache::{AdmitOutcome, CacheConfig, QueryCache, ResponseHeaders};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const REQUEST_BODY: &str = r#"{
    "from": "1699996400000",
    "to": "1700000000000",
    "queries": [
        { "refId": "A", "datasource": { "type": "prometheus", "uid": "prom-main" }, "expr": "up" }
    ]
}"#;

/// Stand-in for the proxied upstream call
async fn fetch_origin(calls: &AtomicUsize) -> (String, ResponseHeaders) {
    calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut headers = ResponseHeaders::new();
    headers.insert("Content-Type".to_string(), vec!["application/json".to_string()]);
    (r#"{"results":{"A":{"frames":[]}}}"#.to_string(), headers)
}

async fn handle_request(id: usize, cache: QueryCache, origin_calls: Arc<AtomicUsize>) -> Result<()> {
    let started = Instant::now();
    let derived = cache.derive_key_from_slice(REQUEST_BODY.as_bytes())?;

    match cache.lookup(&derived.cache_key, std::future::pending()).await {
        Ok(Some(response)) => {
            info!(id, elapsed = ?started.elapsed(), bytes = response.body.len(), "served from cache");
            return Ok(());
        }
        Ok(None) => {}
        Err(e) if e.is_retryable() => info!(id, "coalescing failed ({}), fetching origin", e),
        Err(e) => return Err(e.into()),
    }

    let outcome = cache.try_admit(&derived.cache_key);
    if outcome == AdmitOutcome::AlreadyPresent {
        // someone else claimed the fetch between our lookup and admission
        if let Ok(Some(response)) = cache.lookup(&derived.cache_key, std::future::pending()).await {
            info!(id, elapsed = ?started.elapsed(), bytes = response.body.len(), "served from cache");
            return Ok(());
        }
    }

    let admitted = outcome == AdmitOutcome::Admitted;
    let (body, headers) = fetch_origin(&origin_calls).await;
    if admitted {
        if let Err(e) = cache.store_response(&derived.cache_key, body, &headers) {
            info!(id, "response not cached: {}", e);
        }
    }
    info!(id, elapsed = ?started.elapsed(), admitted, "served from origin");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "coalescing_demo=info,query_response_cache=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cache = QueryCache::new(CacheConfig::from_env()?)?;
    let origin_calls = Arc::new(AtomicUsize::new(0));

    info!("first wave: 20 concurrent identical requests");
    let wave = (0..20).map(|id| tokio::spawn(handle_request(id, cache.clone(), Arc::clone(&origin_calls))));
    for result in futures::future::join_all(wave).await {
        result??;
    }

    info!("second wave: 5 more requests");
    for id in 20..25 {
        handle_request(id, cache.clone(), Arc::clone(&origin_calls)).await?;
    }

    info!(origin_calls = origin_calls.load(Ordering::SeqCst), "done");
    println!("{}", cache.stats());
    Ok(())
}
