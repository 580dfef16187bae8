//! Shared state store backed by Redis.
//!
//! This module provides a store that multiple processes can share. Every
//! operation is a single atomic round-trip: fixed windows use a MULTI/EXEC
//! transaction and token buckets run inside a server-side Lua script, so
//! concurrent requests for the same key can never interleave their
//! read-modify-write steps.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::store::{
    bucket_ttl_ms, window_bounds, RateLimitStore, TokenConsumption, WindowCount,
};
use crate::error::{FloodgateError, Result};

/// Default namespace for all keys written by the store.
pub const DEFAULT_KEY_PREFIX: &str = "rl";

/// Refill, conditionally take one token, persist and refresh the TTL.
///
/// KEYS[1] bucket hash; ARGV capacity, refill rate (tokens/s), now (ms), TTL (ms).
/// Returns { allowed (0/1), floor(tokens), floor(reset_at) }.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])

local data = redis.call('HMGET', key, 'tokens', 'lastRefillAt')
local tokens = tonumber(data[1])
local last_refill = tonumber(data[2])

if not tokens or not last_refill then
  tokens = capacity
  last_refill = now_ms
end

local elapsed_sec = (now_ms - last_refill) / 1000.0
if elapsed_sec < 0 then
  elapsed_sec = 0
end

if refill_rate > 0 then
  tokens = math.min(capacity, tokens + elapsed_sec * refill_rate)
else
  tokens = math.min(capacity, tokens)
end

local allowed = 0
if tokens >= 1.0 then
  tokens = tokens - 1.0
  allowed = 1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'lastRefillAt', tostring(now_ms))
redis.call('PEXPIRE', key, ttl_ms)

local wait_ms
if refill_rate > 0 then
  wait_ms = math.max(0, capacity - tokens) / refill_rate * 1000.0
else
  wait_ms = ttl_ms
end

local tokens_left = math.floor(math.max(0, tokens))
return { allowed, tokens_left, math.floor(now_ms + wait_ms) }
"#;

/// Key layout used by [`RedisStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key of one fixed window. Each window gets its own key so that old
    /// windows expire on their own.
    /// Format: "{prefix}:fw:{client}:{window_ms}:{window_start}"
    pub fn fixed_window(&self, client: &str, window_ms: u64, window_start: i64) -> String {
        format!("{}:fw:{}:{}:{}", self.prefix, client, window_ms, window_start)
    }

    /// Key of a client's token bucket.
    /// Format: "{prefix}:tb:{client}"
    pub fn token_bucket(&self, client: &str) -> String {
        format!("{}:tb:{}", self.prefix, client)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// A [`RateLimitStore`] shared by every process connected to the same Redis.
///
/// The connection manager reconnects transparently and is cheap to clone,
/// so one store can serve all concurrent requests.
pub struct RedisStore {
    connection: ConnectionManager,
    keys: RedisKeys,
    clock: Arc<dyn Clock>,
    token_bucket: Script,
}

impl RedisStore {
    /// Connect to Redis at `redis_url` using the default key prefix.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Self::connect_with_prefix(redis_url, DEFAULT_KEY_PREFIX).await
    }

    /// Connect to Redis at `redis_url`, namespacing keys under `key_prefix`.
    pub async fn connect_with_prefix(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;

        info!(key_prefix = %key_prefix, "Connected to Redis state store");
        Ok(Self::new(connection, RedisKeys::new(key_prefix)))
    }

    /// Create a store from an existing connection.
    pub fn new(connection: ConnectionManager, keys: RedisKeys) -> Self {
        Self {
            connection,
            keys,
            clock: Arc::new(SystemClock),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }

    /// Read the time passed to Redis from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Key layout used by this store.
    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(FloodgateError::Store(format!(
                "unexpected PING reply: {}",
                reply
            )))
        }
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn increment_window_counter(&self, key: &str, window_ms: u64) -> Result<WindowCount> {
        let now = self.clock.now_ms();
        let (start, reset_at) = window_bounds(now, window_ms)?;
        let redis_key = self.keys.fixed_window(key, window_ms, start);

        // The TTL is refreshed on every hit; the key is dead once the window
        // has moved on regardless.
        let mut conn = self.connection.clone();
        let (current,): (u64,) = redis::pipe()
            .atomic()
            .incr(&redis_key, 1u64)
            .pexpire(&redis_key, reset_at - start)
            .ignore()
            .query_async(&mut conn)
            .await?;

        trace!(key = %redis_key, current = current, "Counted window hit");

        Ok(WindowCount { current, reset_at })
    }

    async fn consume_token(
        &self,
        key: &str,
        capacity: u64,
        refill_rate_per_sec: f64,
    ) -> Result<TokenConsumption> {
        let now = self.clock.now_ms();
        let ttl_ms = bucket_ttl_ms(capacity, refill_rate_per_sec);
        let redis_key = self.keys.token_bucket(key);

        let mut conn = self.connection.clone();
        let (allowed, tokens_left, reset_at): (i64, i64, i64) = self
            .token_bucket
            .key(&redis_key)
            .arg(capacity)
            .arg(refill_rate_per_sec)
            .arg(now)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        if allowed == 0 {
            debug!(key = %redis_key, "Token bucket empty");
        }

        Ok(TokenConsumption {
            allowed: allowed == 1,
            tokens_left: tokens_left.max(0) as u64,
            reset_at: reset_at.max(now),
        })
    }
}
