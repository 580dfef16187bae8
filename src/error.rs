//! Error types for the Floodgate rate limiter.

use thiserror::Error;

/// Main error type for Floodgate operations.
///
/// A denied request is not an error; it is reported through
/// [`RateLimitResult::allowed`](crate::ratelimit::RateLimitResult).
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// A rule or configuration file cannot serve its purpose
    #[error("Configuration error: {0}")]
    Config(String),

    /// The state store failed in a backend-agnostic way
    #[error("Store error: {0}")]
    Store(String),

    /// Redis errors from the shared store
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
