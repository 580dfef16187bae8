//! Floodgate - HTTP Rate Limiting
//!
//! This crate decides, per client and per route, whether a request may
//! proceed. Limits are resolved from a route catalog and the caller's plan
//! tier, evaluated with a fixed-window or token-bucket algorithm, and backed
//! by either an in-process store or a Redis store shared between instances.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
