//! Integration tests for the query response cache
//!
//! These tests verify the complete cache behavior including:
//! - Admission threshold
//! - Request coalescing
//! - Size accounting and LRU eviction
//! - Waiter cleanup and clear
//! - Key derivation

use futures::future::join_all;
use query_response_cache::{
    AdmitOutcome, BoundedCache, CacheConfig, CacheError, CapacityReason, EntryStatus,
    QueryCache, QueryRequest, StoreOutcome,
};
use rand::Rng;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn never() -> std::future::Pending<()> {
    std::future::pending()
}

fn payload(len: usize) -> Vec<u8> {
    vec![b'x'; len]
}

/// Budget of 1000 bytes where a single entry may use all of it
fn small_budget(min_uses: u64) -> CacheConfig {
    CacheConfig::builder()
        .ttl(Duration::from_secs(60))
        .max_entries(100)
        .max_memory_bytes(1000)
        .max_entry_bytes(1000)
        .min_uses(min_uses)
        .build()
}

async fn wait_for_subscribers(cache: &BoundedCache, key: &str, count: usize) {
    while cache
        .get(key)
        .map_or(0, |entry| entry.subscriber_count())
        < count
    {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_admission_threshold() {
    let cache = QueryCache::new(small_budget(3)).unwrap();

    assert_eq!(cache.try_admit("k"), AdmitOutcome::BelowThreshold { uses: 1 });
    assert_eq!(
        cache.store("k", "value", "").unwrap(),
        StoreOutcome::BelowThreshold { uses: 2 }
    );
    assert!(cache.lookup("k", never()).await.unwrap().is_none());

    // third observation reaches the threshold
    assert_eq!(cache.try_admit("k"), AdmitOutcome::Admitted);
    assert_eq!(cache.store("k", "value", "").unwrap(), StoreOutcome::Stored);
    assert!(cache.lookup("k", never()).await.unwrap().is_some());

    let stats = cache.stats();
    assert_eq!(stats.admission_rejections, 2);
    assert_eq!(stats.admissions, 1);
}

#[tokio::test]
async fn test_coalescing_fetches_origin_once() {
    let cache = QueryCache::new(CacheConfig::default()).unwrap();
    let origin_calls = Arc::new(AtomicUsize::new(0));

    let workers = (0..10).map(|_| {
        let cache = cache.clone();
        let origin_calls = Arc::clone(&origin_calls);
        tokio::spawn(async move {
            if let Some(hit) = cache.lookup("hot", never()).await.unwrap() {
                return hit.body;
            }
            match cache.try_admit("hot") {
                AdmitOutcome::Admitted => {
                    origin_calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    cache.store("hot", "origin body", "{}").unwrap();
                    bytes::Bytes::from_static(b"origin body")
                }
                _ => cache.lookup("hot", never()).await.unwrap().unwrap().body,
            }
        })
    });

    let bodies = join_all(workers).await;

    assert_eq!(origin_calls.load(Ordering::SeqCst), 1);
    for body in bodies {
        assert_eq!(body.unwrap(), bytes::Bytes::from_static(b"origin body"));
    }
}

#[tokio::test]
async fn test_all_waiters_receive_same_value() {
    let cache = QueryCache::new(CacheConfig::default()).unwrap();
    assert_eq!(cache.try_admit("k"), AdmitOutcome::Admitted);

    let waiters: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.lookup("k", never()).await })
        })
        .collect();
    wait_for_subscribers(&cache.inner(), "k", 5).await;

    cache.store("k", "shared", "").unwrap();

    for result in join_all(waiters).await {
        let response = result.unwrap().unwrap().unwrap();
        assert_eq!(response.body, bytes::Bytes::from_static(b"shared"));
    }
    assert_eq!(cache.stats().coalesced_waits, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_size_invariant_under_concurrent_stores() {
    let cache = BoundedCache::new(small_budget(0)).unwrap();

    let writers = (0..8).map(|worker| {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            for round in 0..50 {
                let (key, len) = {
                    let mut rng = rand::thread_rng();
                    (format!("key-{}", rng.gen_range(0..12)), rng.gen_range(1..400))
                };
                // in-flight reservations of other writers can exhaust the budget
                match cache.set(&key, payload(len).into(), Default::default()) {
                    Ok(_)
                    | Err(CacheError::Capacity {
                        reason: CapacityReason::BudgetExhausted,
                        ..
                    }) => {}
                    Err(e) => panic!("unexpected store error: {e}"),
                }
                if (worker + round) % 7 == 0 {
                    cache.remove(&key);
                }
                tokio::task::yield_now().await;
            }
        })
    });
    for writer in join_all(writers).await {
        writer.unwrap();
    }

    assert_eq!(cache.size_bytes(), cache.computed_size_bytes());
    assert!(cache.size_bytes() <= 1000);
}

#[tokio::test]
async fn test_eviction_makes_room_lru_first() {
    let cache = BoundedCache::new(small_budget(0)).unwrap();

    cache.set("a", payload(300).into(), Default::default()).unwrap();
    cache.set("b", payload(300).into(), Default::default()).unwrap();
    cache.set("c", payload(300).into(), Default::default()).unwrap();
    cache.get("a");

    cache.set("d", payload(500).into(), Default::default()).unwrap();

    assert!(cache.contains_key("a"));
    assert!(!cache.contains_key("b"));
    assert!(!cache.contains_key("c"));
    assert!(cache.contains_key("d"));
    assert_eq!(cache.size_bytes(), 800);
    assert_eq!(cache.stats().evictions_size, 2);
}

#[tokio::test]
async fn test_oversized_value_fails_and_wakes_waiters() {
    let cache = QueryCache::new(small_budget(0)).unwrap();
    cache.try_admit("big");

    let waiter = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.lookup("big", never()).await })
    };
    wait_for_subscribers(&cache.inner(), "big", 1).await;

    let err = cache.store("big", payload(1001), "").unwrap_err();
    assert!(matches!(
        err,
        CacheError::Capacity {
            reason: CapacityReason::ExceedsMemoryBudget,
            ..
        }
    ));

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        CacheError::StaleNotification {
            state: EntryStatus::Failed,
            ..
        }
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_waiter_cleanup_on_timeout_and_cancel() {
    let cache = QueryCache::new(CacheConfig::default()).unwrap();
    cache.try_admit("k");

    let err = cache
        .lookup_with_timeout("k", never(), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::CoalescingTimeout { .. }));

    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let waiter = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .lookup("k", async move {
                    let _ = cancel_rx.await;
                })
                .await
        })
    };
    wait_for_subscribers(&cache.inner(), "k", 1).await;
    cancel_tx.send(()).unwrap();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, CacheError::CoalescingCancelled { .. }));

    let entry = cache.inner().get("k").unwrap();
    assert_eq!(entry.subscriber_count(), 0);
    assert_eq!(entry.status(), EntryStatus::Updating);

    let stats = cache.stats();
    assert_eq!(stats.wait_timeouts, 1);
    assert_eq!(stats.wait_cancellations, 1);
}

#[tokio::test]
async fn test_clear_unblocks_every_waiter() {
    let cache = QueryCache::new(CacheConfig::default()).unwrap();
    cache.try_admit("a");
    cache.try_admit("b");
    cache.store("c", "cached", "").unwrap();

    let waiters: Vec<_> = ["a", "a", "b"]
        .into_iter()
        .map(|key| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.lookup(key, never()).await })
        })
        .collect();
    wait_for_subscribers(&cache.inner(), "a", 2).await;
    wait_for_subscribers(&cache.inner(), "b", 1).await;

    let event = cache.clear();
    assert_eq!(event.keys.len(), 3);
    assert_eq!(event.freed_bytes, 6);

    for result in join_all(waiters).await {
        let err = result.unwrap().unwrap_err();
        assert!(matches!(
            err,
            CacheError::StaleNotification {
                state: EntryStatus::Expired,
                ..
            }
        ));
    }
    assert_eq!(cache.stats().entries, 0);
    assert_eq!(cache.inner().size_bytes(), 0);
}

#[tokio::test]
async fn test_key_determinism_through_facade() {
    let cache = QueryCache::new(CacheConfig::default()).unwrap();
    let queries = vec![json!({ "refId": "A", "datasource": { "uid": "prom" }, "expr": "rate(x[5m])" })];

    // a 1ms shift stays in both buckets; widening the range by 10 minutes does not
    let a = cache
        .derive_key(&QueryRequest::new("1700000000000", "1699996400000", queries.clone()))
        .unwrap();
    let b = cache
        .derive_key(&QueryRequest::new("1700000000001", "1699996400001", queries.clone()))
        .unwrap();
    let c = cache
        .derive_key(&QueryRequest::new("1700000600000", "1699996400000", queries))
        .unwrap();

    assert_eq!(a, b);
    assert_ne!(a.cache_key, c.cache_key);
    assert_eq!(a.data_source_ids, vec!["prom".to_string()]);
}

#[tokio::test]
async fn test_example_scenario() {
    let cache = QueryCache::new(small_budget(2)).unwrap();

    // first request for A is not hot yet
    assert!(cache.lookup("A", never()).await.unwrap().is_none());
    assert_eq!(cache.try_admit("A"), AdmitOutcome::BelowThreshold { uses: 1 });

    // second request for A claims the fetch
    assert!(cache.lookup("A", never()).await.unwrap().is_none());
    assert_eq!(cache.try_admit("A"), AdmitOutcome::Admitted);

    // third request arrives while the fetch is in flight
    let coalesced = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.lookup("A", never()).await })
    };
    wait_for_subscribers(&cache.inner(), "A", 1).await;

    assert_eq!(cache.store("A", payload(400), "").unwrap(), StoreOutcome::Stored);
    let response = coalesced.await.unwrap().unwrap().unwrap();
    assert_eq!(response.body.len(), 400);

    // B is hot and pushes A out of the budget
    assert_eq!(cache.try_admit("B"), AdmitOutcome::BelowThreshold { uses: 1 });
    assert_eq!(cache.try_admit("B"), AdmitOutcome::Admitted);
    assert_eq!(cache.store("B", payload(700), "").unwrap(), StoreOutcome::Stored);

    assert!(cache.lookup("A", never()).await.unwrap().is_none());
    assert_eq!(cache.lookup("B", never()).await.unwrap().unwrap().body.len(), 700);
    assert_eq!(cache.inner().size_bytes(), 700);
}

#[tokio::test]
async fn test_cache_dropped_stops_background_tasks() {
    let config = CacheConfig::builder()
        .ttl(Duration::from_millis(20))
        .expiry_sweep_interval(Duration::from_millis(10))
        .build();
    let cache = BoundedCache::new(config).unwrap();
    cache.set("k", payload(10).into(), Default::default()).unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    // purged in the background without any lookup
    assert!(cache.is_empty());
    assert_eq!(cache.size_bytes(), 0);

    let weak = Arc::downgrade(&cache);
    drop(cache);
    assert!(weak.upgrade().is_none());
}
