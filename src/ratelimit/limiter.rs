//! Core rate limiter implementation.

use std::sync::Arc;
use tracing::{debug, trace};

use super::rules::{Algorithm, RateLimitRule};
use super::store::RateLimitStore;
use crate::error::{FloodgateError, Result};

/// The decision for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests left in the window, or whole tokens left in the bucket
    pub remaining: u64,
    /// Unix time in milliseconds when the limit is expected to clear
    pub reset_at: i64,
}

/// The core rate limiter that turns store state into decisions.
///
/// The limiter keeps no per-key state of its own; all of it lives in the
/// store. One instance can be shared across every concurrent request.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    /// Create a rate limiter on top of a state store.
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    /// Count a request for `key` under `rule` and decide whether it may proceed.
    ///
    /// Store errors are returned as-is; the caller chooses how to fail.
    pub async fn check_and_consume(
        &self,
        key: &str,
        rule: &RateLimitRule,
        algorithm: Algorithm,
    ) -> Result<RateLimitResult> {
        trace!(
            key = %key,
            algorithm = %algorithm,
            limit = rule.max_requests,
            "Checking rate limit"
        );

        let result = match algorithm {
            Algorithm::FixedWindow => self.check_fixed_window(key, rule).await?,
            Algorithm::TokenBucket => self.check_token_bucket(key, rule).await?,
        };

        if !result.allowed {
            debug!(
                key = %key,
                algorithm = %algorithm,
                limit = rule.max_requests,
                reset_at = result.reset_at,
                "Rate limit exceeded"
            );
        }

        Ok(result)
    }

    async fn check_fixed_window(&self, key: &str, rule: &RateLimitRule) -> Result<RateLimitResult> {
        let window_ms = rule.window_ms.ok_or_else(|| {
            FloodgateError::Config("window_ms is required for fixed-window algorithm".to_string())
        })?;

        let count = self.store.increment_window_counter(key, window_ms).await?;

        // The request that brings the count to max_requests is still allowed.
        Ok(RateLimitResult {
            allowed: count.current <= rule.max_requests,
            remaining: rule.max_requests.saturating_sub(count.current),
            reset_at: count.reset_at,
        })
    }

    async fn check_token_bucket(&self, key: &str, rule: &RateLimitRule) -> Result<RateLimitResult> {
        let consumption = self
            .store
            .consume_token(key, rule.capacity(), rule.refill_rate())
            .await?;

        Ok(RateLimitResult {
            allowed: consumption.allowed,
            remaining: consumption.tokens_left,
            reset_at: consumption.reset_at,
        })
    }
}
