//! In-process state store.
//!
//! State lives in this process only, so the store is correct only when a
//! single process serves all traffic for a client.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::store::{
    bucket_reset_at, bucket_ttl_ms, refill_and_take, window_bounds, window_start, RateLimitStore,
    TokenConsumption, WindowCount,
};
use crate::error::Result;

/// Expired entries are swept once per this many store operations.
const EVICTION_INTERVAL: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    client: String,
    window_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct FixedWindowEntry {
    count: u64,
    window_start: i64,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketEntry {
    tokens: f64,
    last_refill_at: i64,
    ttl_ms: i64,
}

/// A [`RateLimitStore`] backed by concurrent hash maps.
///
/// Each operation holds the shard lock of its key for the whole
/// read-modify-write, which makes it atomic with respect to other callers.
pub struct MemoryStore {
    windows: DashMap<WindowKey, FixedWindowEntry>,
    buckets: DashMap<String, TokenBucketEntry>,
    clock: Arc<dyn Clock>,
    ops_counter: AtomicU64,
}

impl MemoryStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            buckets: DashMap::new(),
            clock,
            ops_counter: AtomicU64::new(0),
        }
    }

    /// Remove windows that have ended and buckets idle past their TTL.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.len();

        self.windows
            .retain(|key, entry| window_end(entry.window_start, key.window_ms) > now);
        self.buckets
            .retain(|_, entry| entry.last_refill_at.saturating_add(entry.ttl_ms) > now);

        let removed = before.saturating_sub(self.len());
        if removed > 0 {
            debug!(removed = removed, "Evicted idle rate limit entries");
        }
        removed
    }

    fn maybe_purge_expired(&self) {
        let count = self.ops_counter.fetch_add(1, Ordering::Relaxed);
        if count % EVICTION_INTERVAL == EVICTION_INTERVAL - 1 {
            self.purge_expired();
        }
    }

    /// Current count of the live window for `key`, if any.
    pub fn window_count(&self, key: &str, window_ms: u64) -> Option<u64> {
        if window_ms == 0 {
            return None;
        }
        let start = window_start(self.clock.now_ms(), window_ms);
        let window_key = WindowKey {
            client: key.to_string(),
            window_ms,
        };
        self.windows
            .get(&window_key)
            .filter(|entry| entry.window_start == start)
            .map(|entry| entry.count)
    }

    /// Stored token balance for `key`, as of its last refill.
    pub fn bucket_tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|entry| entry.tokens)
    }

    /// Total number of window and bucket entries held.
    pub fn len(&self) -> usize {
        self.windows.len() + self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.windows.clear();
        self.buckets.clear();
    }
}

fn window_end(start: i64, window_ms: u64) -> i64 {
    start.saturating_add(i64::try_from(window_ms).unwrap_or(i64::MAX))
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn increment_window_counter(&self, key: &str, window_ms: u64) -> Result<WindowCount> {
        let now = self.clock.now_ms();
        let (start, reset_at) = window_bounds(now, window_ms)?;
        self.maybe_purge_expired();

        let mut entry = self
            .windows
            .entry(WindowKey {
                client: key.to_string(),
                window_ms,
            })
            .or_insert(FixedWindowEntry {
                count: 0,
                window_start: start,
            });

        if entry.window_start != start {
            *entry = FixedWindowEntry {
                count: 1,
                window_start: start,
            };
        } else {
            entry.count += 1;
        }
        let current = entry.count;
        drop(entry);

        trace!(key = %key, window_ms = window_ms, current = current, "Counted window hit");

        Ok(WindowCount { current, reset_at })
    }

    async fn consume_token(
        &self,
        key: &str,
        capacity: u64,
        refill_rate_per_sec: f64,
    ) -> Result<TokenConsumption> {
        self.maybe_purge_expired();

        let now = self.clock.now_ms();
        let ttl_ms = bucket_ttl_ms(capacity, refill_rate_per_sec);

        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert(TokenBucketEntry {
                tokens: capacity as f64,
                last_refill_at: now,
                ttl_ms,
            });

        let (tokens, allowed) = refill_and_take(
            entry.tokens,
            entry.last_refill_at,
            now,
            capacity,
            refill_rate_per_sec,
        );
        *entry = TokenBucketEntry {
            tokens,
            last_refill_at: now,
            ttl_ms,
        };
        drop(entry);

        trace!(key = %key, tokens = tokens, allowed = allowed, "Consumed bucket token");

        Ok(TokenConsumption {
            allowed,
            tokens_left: tokens.max(0.0).floor() as u64,
            reset_at: bucket_reset_at(now, tokens, capacity, refill_rate_per_sec),
        })
    }
}
