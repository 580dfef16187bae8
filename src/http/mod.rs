//! HTTP middleware and demo server.

mod middleware;
mod server;

pub use middleware::{
    rate_limit, RateLimitState, API_KEY_HEADER, RATE_LIMIT_LIMIT, RATE_LIMIT_PLAN,
    RATE_LIMIT_REMAINING, RATE_LIMIT_RESET,
};
pub use server::{router, HttpServer};
