//! Redis store tests against a throwaway Redis container.
//!
//! Each test starts its own `redis` container through testcontainers, so a
//! Docker daemon must be reachable.

use std::sync::Arc;

use floodgate::ratelimit::{
    bucket_ttl_ms, Clock, ManualClock, RateLimitStore, RedisStore,
};
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;

const START: i64 = 1_700_000_000_000;

/// Start a Redis container and return it with its connection URL.
///
/// The container is removed when the returned handle is dropped.
async fn start_redis() -> (ContainerAsync<Redis>, String) {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start Redis container");

    let host = container
        .get_host()
        .await
        .expect("Failed to get Redis host");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get Redis port");

    (container, format!("redis://{}:{}", host, port))
}

async fn store_at(redis_url: &str, clock: ManualClock) -> RedisStore {
    RedisStore::connect(redis_url)
        .await
        .expect("Failed to connect to Redis")
        .with_clock(Arc::new(clock))
}

async fn pttl(redis_url: &str, key: &str) -> i64 {
    let client = redis::Client::open(redis_url).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let ttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await.unwrap();
    ttl
}

#[tokio::test]
async fn test_redis_ping() {
    let (_container, url) = start_redis().await;
    let store = store_at(&url, ManualClock::default()).await;
    store.ping().await.unwrap();
}

#[tokio::test]
async fn test_redis_window_counter_and_rollover() {
    let (_container, url) = start_redis().await;
    let clock = ManualClock::new(START);
    let store = store_at(&url, clock.clone()).await;

    for expected in 1..=3 {
        let count = store.increment_window_counter("client", 60_000).await.unwrap();
        assert_eq!(count.current, expected);
        assert_eq!(count.reset_at, 1_700_000_040_000);
    }

    clock.advance_ms(60_000);
    let count = store.increment_window_counter("client", 60_000).await.unwrap();
    assert_eq!(count.current, 1);
    assert_eq!(count.reset_at, 1_700_000_100_000);
}

#[tokio::test]
async fn test_redis_window_key_expires_with_window() {
    let (_container, url) = start_redis().await;
    let clock = ManualClock::new(START);
    let store = store_at(&url, clock).await;

    store.increment_window_counter("client", 60_000).await.unwrap();

    let key = store
        .keys()
        .fixed_window("client", 60_000, 1_699_999_980_000);
    let ttl = pttl(&url, &key).await;
    assert!(ttl > 0, "window key has no TTL: {}", ttl);
    assert!(ttl <= 60_000, "window key outlives its window: {}", ttl);
}

#[tokio::test]
async fn test_redis_oversized_window_is_rejected() {
    let (_container, url) = start_redis().await;
    let store = store_at(&url, ManualClock::new(START)).await;

    for window_ms in [0, u64::MAX, 1 << 63] {
        let result = store.increment_window_counter("client", window_ms).await;
        assert!(matches!(
            result,
            Err(floodgate::error::FloodgateError::Config(_))
        ));
    }
}

#[tokio::test]
async fn test_redis_token_bucket_matches_memory_semantics() {
    let (_container, url) = start_redis().await;
    let clock = ManualClock::new(START);
    let store = store_at(&url, clock.clone()).await;

    let first = store.consume_token("client", 3, 2.0).await.unwrap();
    assert!(first.allowed);
    assert_eq!(first.tokens_left, 2);
    assert_eq!(first.reset_at, START + 500);

    for _ in 0..2 {
        assert!(store.consume_token("client", 3, 2.0).await.unwrap().allowed);
    }
    let denied = store.consume_token("client", 3, 2.0).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.tokens_left, 0);
    assert_eq!(denied.reset_at, clock.now_ms() + 1_500);

    clock.advance_ms(1_000);
    let refilled = store.consume_token("client", 3, 2.0).await.unwrap();
    assert!(refilled.allowed);
    assert_eq!(refilled.tokens_left, 1);
}

#[tokio::test]
async fn test_redis_denied_call_still_records_refill() {
    let (_container, url) = start_redis().await;
    let clock = ManualClock::new(START);
    let store = store_at(&url, clock.clone()).await;

    assert!(store.consume_token("client", 1, 1.0).await.unwrap().allowed);

    // 0.6 tokens is persisted even though the call is denied
    clock.advance_ms(600);
    assert!(!store.consume_token("client", 1, 1.0).await.unwrap().allowed);

    clock.advance_ms(500);
    assert!(store.consume_token("client", 1, 1.0).await.unwrap().allowed);
}

#[tokio::test]
async fn test_redis_bucket_is_clamped_to_smaller_capacity() {
    let (_container, url) = start_redis().await;
    let clock = ManualClock::new(START);
    let store = store_at(&url, clock.clone()).await;

    // Filled under capacity 10, then read under capacity 3
    let large = store.consume_token("shared", 10, 1.0).await.unwrap();
    assert_eq!(large.tokens_left, 9);

    let small = store.consume_token("shared", 3, 1.0).await.unwrap();
    assert!(small.allowed);
    assert_eq!(small.tokens_left, 2);
    assert_eq!(small.reset_at, START + 1_000);

    // Back under capacity 10 the balance is the clamped one
    let large = store.consume_token("shared", 10, 1.0).await.unwrap();
    assert!(large.allowed);
    assert_eq!(large.tokens_left, 1);
}

#[tokio::test]
async fn test_redis_bucket_key_has_ttl() {
    let (_container, url) = start_redis().await;
    let store = store_at(&url, ManualClock::new(START)).await;

    store.consume_token("client", 60, 1.0).await.unwrap();

    let ttl = pttl(&url, &store.keys().token_bucket("client")).await;
    assert!(ttl > 0, "bucket key has no TTL: {}", ttl);
    assert!(ttl <= bucket_ttl_ms(60, 1.0));
}

#[tokio::test]
async fn test_redis_concurrent_consumers_never_overspend() {
    let (_container, url) = start_redis().await;
    let store = Arc::new(store_at(&url, ManualClock::new(START)).await);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.consume_token("shared", 10, 1.0).await })
        })
        .collect();

    let allowed = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|handle| handle.as_ref().unwrap().as_ref().unwrap().allowed)
        .count();
    assert_eq!(allowed, 10);
}

#[tokio::test]
async fn test_redis_concurrent_window_increments_are_exact() {
    let (_container, url) = start_redis().await;
    let store = Arc::new(store_at(&url, ManualClock::new(START)).await);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.increment_window_counter("shared", 60_000).await })
        })
        .collect();

    let mut counts: Vec<u64> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|handle| handle.unwrap().unwrap().current)
        .collect();
    counts.sort_unstable();
    assert_eq!(counts, (1..=50).collect::<Vec<u64>>());
}
