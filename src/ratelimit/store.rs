//! State store trait for abstracting local and shared implementations.

use async_trait::async_trait;

use crate::error::{FloodgateError, Result};

/// Minimum lifetime of an idle token bucket, in milliseconds.
pub const MIN_BUCKET_TTL_MS: i64 = 60_000;

/// Result of counting a request in a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests counted in the current window, including this one
    pub current: u64,
    /// Unix time in milliseconds when the window ends
    pub reset_at: i64,
}

/// Result of taking a token from a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenConsumption {
    pub allowed: bool,
    /// Whole tokens left after this call
    pub tokens_left: u64,
    /// Unix time in milliseconds when the bucket would be full again
    pub reset_at: i64,
}

/// Trait for rate limit state stores.
///
/// Both operations must be atomic per key: concurrent callers, whether in
/// this process or in other processes sharing the backend, observe each
/// read-modify-write as a single step.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one request against the window of `window_ms` that contains now.
    ///
    /// The count restarts at 1 whenever the aligned window start moves.
    async fn increment_window_counter(&self, key: &str, window_ms: u64) -> Result<WindowCount>;

    /// Refill the bucket for the elapsed time, then take one token if available.
    ///
    /// The refill is persisted even when no token could be taken.
    async fn consume_token(
        &self,
        key: &str,
        capacity: u64,
        refill_rate_per_sec: f64,
    ) -> Result<TokenConsumption>;
}

/// Start of the fixed window of length `window_ms` that contains `now_ms`.
///
/// Lengths beyond `i64::MAX` are treated as `i64::MAX`.
pub fn window_start(now_ms: i64, window_ms: u64) -> i64 {
    let window_ms = i64::try_from(window_ms).unwrap_or(i64::MAX).max(1);
    now_ms.div_euclid(window_ms).saturating_mul(window_ms)
}

/// Start and end of the fixed window of length `window_ms` that contains `now_ms`.
///
/// Fails for a zero length, a length that does not fit in an `i64`, or a
/// window whose end is past the representable time range.
pub fn window_bounds(now_ms: i64, window_ms: u64) -> Result<(i64, i64)> {
    let length = match i64::try_from(window_ms) {
        Ok(0) => {
            return Err(FloodgateError::Config(
                "window_ms must be greater than zero".to_string(),
            ))
        }
        Ok(length) => length,
        Err(_) => {
            return Err(FloodgateError::Config(format!(
                "window_ms must be at most {}",
                i64::MAX
            )))
        }
    };

    let out_of_range = || {
        FloodgateError::Config(format!(
            "window of {} ms containing {} is outside the representable time range",
            window_ms, now_ms
        ))
    };
    let start = now_ms
        .div_euclid(length)
        .checked_mul(length)
        .ok_or_else(out_of_range)?;
    let end = start.checked_add(length).ok_or_else(out_of_range)?;
    Ok((start, end))
}

/// Milliseconds for an empty bucket to fill back to `capacity`.
///
/// A non-positive rate never fills; [`MIN_BUCKET_TTL_MS`] stands in for it.
pub fn time_to_full_ms(capacity: u64, refill_rate_per_sec: f64) -> f64 {
    if refill_rate_per_sec > 0.0 {
        capacity as f64 / refill_rate_per_sec * 1000.0
    } else {
        MIN_BUCKET_TTL_MS as f64
    }
}

/// How long an idle bucket is kept before it may be evicted.
pub fn bucket_ttl_ms(capacity: u64, refill_rate_per_sec: f64) -> i64 {
    let ttl = (time_to_full_ms(capacity, refill_rate_per_sec) * 2.0).ceil();
    if ttl.is_finite() {
        (ttl as i64).max(MIN_BUCKET_TTL_MS)
    } else {
        MIN_BUCKET_TTL_MS
    }
}

/// Apply lazy refill and a conditional take to a bucket balance.
///
/// Returns the new balance and whether a token was taken. Negative elapsed
/// time counts as zero.
pub(crate) fn refill_and_take(
    tokens: f64,
    last_refill_at: i64,
    now_ms: i64,
    capacity: u64,
    refill_rate_per_sec: f64,
) -> (f64, bool) {
    let elapsed_sec = ((now_ms - last_refill_at) as f64 / 1000.0).max(0.0);
    let refill = (elapsed_sec * refill_rate_per_sec).max(0.0);
    let tokens = (tokens + refill).min(capacity as f64);

    if tokens >= 1.0 {
        (tokens - 1.0, true)
    } else {
        (tokens, false)
    }
}

/// Unix time when a bucket holding `tokens` would be full again.
pub(crate) fn bucket_reset_at(
    now_ms: i64,
    tokens: f64,
    capacity: u64,
    refill_rate_per_sec: f64,
) -> i64 {
    let wait_ms = if refill_rate_per_sec > 0.0 {
        (capacity as f64 - tokens).max(0.0) / refill_rate_per_sec * 1000.0
    } else {
        bucket_ttl_ms(capacity, refill_rate_per_sec) as f64
    };
    now_ms.saturating_add(wait_ms.floor() as i64)
}
