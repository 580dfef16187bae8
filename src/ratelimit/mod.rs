//! Rate limiting logic and state management.

mod clock;
mod distributed;
mod key;
mod limiter;
mod memory;
mod plan;
mod rules;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::{RedisKeys, RedisStore, DEFAULT_KEY_PREFIX};
pub use key::{ClientKey, UNKNOWN_CLIENT};
pub use limiter::{RateLimitResult, RateLimiter};
pub use memory::MemoryStore;
pub use plan::{ApiKeyConfig, PlanRegistry, PlanTier};
pub use rules::{
    Algorithm, PlanRules, RateLimitRule, ResolvedRule, RoutePlanRule, RuleCatalog, MAX_WINDOW_MS,
};
pub use store::{
    bucket_ttl_ms, window_bounds, window_start, RateLimitStore, TokenConsumption, WindowCount,
};
