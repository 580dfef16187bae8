//! Rate limit rules configuration and matching.
//!
//! This module handles loading route rules from configuration and resolving
//! the rule that applies to a request. Resolution is a two-level lookup: the
//! request path selects a route group by prefix, then the caller's plan tier
//! selects the rule within that group.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use super::plan::PlanTier;
use crate::error::{FloodgateError, Result};

/// Window used to derive a refill rate when a rule carries no window.
pub const DEFAULT_REFILL_WINDOW_MS: u64 = 60_000;

/// Longest fixed window that still yields a representable reset time.
pub const MAX_WINDOW_MS: u64 = i64::MAX as u64;

/// Rate limiting algorithm applied to a route group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Count requests in aligned, non-overlapping windows
    FixedWindow,
    /// Consume from a continuously refilling balance
    TokenBucket,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed-window",
            Algorithm::TokenBucket => "token-bucket",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rate limit rule.
///
/// Which fields are required depends on the algorithm the rule is used with:
/// fixed-window needs `window_ms`, token-bucket derives anything missing from
/// `max_requests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Requests allowed per window, also the advertised limit
    pub max_requests: u64,
    /// Window length in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
    /// Maximum tokens held by a bucket (defaults to `max_requests`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_capacity: Option<u64>,
    /// Tokens added per second (derived from the window if absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_rate_per_sec: Option<f64>,
}

impl RateLimitRule {
    /// Create a rule with only a request limit.
    pub fn new(max_requests: u64) -> Self {
        Self {
            max_requests,
            window_ms: None,
            bucket_capacity: None,
            refill_rate_per_sec: None,
        }
    }

    pub fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = Some(window_ms);
        self
    }

    pub fn with_bucket_capacity(mut self, capacity: u64) -> Self {
        self.bucket_capacity = Some(capacity);
        self
    }

    pub fn with_refill_rate(mut self, tokens_per_sec: f64) -> Self {
        self.refill_rate_per_sec = Some(tokens_per_sec);
        self
    }

    /// Bucket capacity used by the token-bucket algorithm.
    pub fn capacity(&self) -> u64 {
        self.bucket_capacity.unwrap_or(self.max_requests)
    }

    /// Refill rate used by the token-bucket algorithm, in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate_per_sec.unwrap_or_else(|| {
            let window_ms = self.window_ms.unwrap_or(DEFAULT_REFILL_WINDOW_MS);
            self.max_requests as f64 / (window_ms as f64 / 1000.0)
        })
    }

    /// Check that this rule can be evaluated with `algorithm`.
    pub fn validate(&self, algorithm: Algorithm) -> Result<()> {
        if self.max_requests == 0 {
            return Err(FloodgateError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }

        match algorithm {
            Algorithm::FixedWindow => match self.window_ms {
                None => Err(FloodgateError::Config(
                    "window_ms is required for fixed-window algorithm".to_string(),
                )),
                Some(0) => Err(FloodgateError::Config(
                    "window_ms must be greater than zero".to_string(),
                )),
                Some(window_ms) if window_ms > MAX_WINDOW_MS => Err(FloodgateError::Config(
                    format!("window_ms must be at most {}, got {}", MAX_WINDOW_MS, window_ms),
                )),
                Some(_) => Ok(()),
            },
            Algorithm::TokenBucket => {
                if self.capacity() == 0 {
                    return Err(FloodgateError::Config(
                        "bucket_capacity must be greater than zero".to_string(),
                    ));
                }
                let rate = self.refill_rate();
                if !rate.is_finite() || rate <= 0.0 {
                    return Err(FloodgateError::Config(format!(
                        "refill rate must be a positive number, got {}",
                        rate
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Rules for each plan tier within a route group.
///
/// Only the free tier is mandatory; higher tiers without their own rule
/// share the free rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRules {
    pub free: RateLimitRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pro: Option<RateLimitRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise: Option<RateLimitRule>,
}

impl PlanRules {
    /// Get the rule for a plan tier, falling back to the free tier.
    pub fn for_plan(&self, plan: PlanTier) -> &RateLimitRule {
        let rule = match plan {
            PlanTier::Free => None,
            PlanTier::Pro => self.pro.as_ref(),
            PlanTier::Enterprise => self.enterprise.as_ref(),
        };
        rule.unwrap_or(&self.free)
    }

    fn iter(&self) -> impl Iterator<Item = (PlanTier, &RateLimitRule)> {
        std::iter::once((PlanTier::Free, &self.free))
            .chain(self.pro.as_ref().map(|r| (PlanTier::Pro, r)))
            .chain(self.enterprise.as_ref().map(|r| (PlanTier::Enterprise, r)))
    }
}

/// A route group: every path starting with `route_prefix` shares these rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePlanRule {
    pub route_prefix: String,
    pub algorithm: Algorithm,
    pub rules: PlanRules,
}

impl RoutePlanRule {
    fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.route_prefix)
    }
}

/// The outcome of rule resolution for a single request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedRule<'a> {
    /// Prefix of the matched route group (`default` for the fallback)
    pub route_prefix: &'a str,
    pub algorithm: Algorithm,
    pub rule: &'a RateLimitRule,
}

/// The complete route rule catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCatalog {
    /// Route groups, matched in declaration order
    #[serde(default)]
    pub routes: Vec<RoutePlanRule>,
    /// Group used when no route prefix matches
    pub default: RoutePlanRule,
}

impl RuleCatalog {
    /// Load a catalog from a YAML file and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a catalog from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let catalog: RuleCatalog = serde_yaml::from_str(yaml).map_err(|e| {
            FloodgateError::Config(format!("Failed to parse rate limit rules: {}", e))
        })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Check every rule against the algorithm of its route group.
    pub fn validate(&self) -> Result<()> {
        for group in self.routes.iter().chain(std::iter::once(&self.default)) {
            for (plan, rule) in group.rules.iter() {
                rule.validate(group.algorithm).map_err(|e| match e {
                    FloodgateError::Config(reason) => FloodgateError::Config(format!(
                        "route '{}' plan '{}': {}",
                        group.route_prefix, plan, reason
                    )),
                    other => other,
                })?;
            }
        }
        Ok(())
    }

    /// Resolve the rule for a request path and plan tier.
    ///
    /// The first route group whose prefix matches wins; unmatched paths use
    /// the default group.
    pub fn resolve(&self, path: &str, plan: PlanTier) -> ResolvedRule<'_> {
        let group = self
            .routes
            .iter()
            .find(|group| group.matches(path))
            .unwrap_or(&self.default);

        let resolved = ResolvedRule {
            route_prefix: &group.route_prefix,
            algorithm: group.algorithm,
            rule: group.rules.for_plan(plan),
        };

        debug!(
            path = %path,
            plan = %plan,
            route = %resolved.route_prefix,
            algorithm = %resolved.algorithm,
            "Resolved rate limit rule"
        );

        resolved
    }
}

impl Default for RuleCatalog {
    fn default() -> Self {
        let login = |max| RateLimitRule::new(max).with_window_ms(60_000);
        let api = |max, rate| {
            RateLimitRule::new(max)
                .with_window_ms(60_000)
                .with_bucket_capacity(max)
                .with_refill_rate(rate)
        };
        let fallback = |max| {
            RateLimitRule::new(max)
                .with_window_ms(60_000)
                .with_bucket_capacity(max)
        };

        Self {
            routes: vec![
                RoutePlanRule {
                    route_prefix: "/login".to_string(),
                    algorithm: Algorithm::FixedWindow,
                    rules: PlanRules {
                        free: login(5),
                        pro: Some(login(10)),
                        enterprise: Some(login(20)),
                    },
                },
                RoutePlanRule {
                    route_prefix: "/api".to_string(),
                    algorithm: Algorithm::TokenBucket,
                    rules: PlanRules {
                        free: api(60, 1.0),
                        pro: Some(api(600, 10.0)),
                        enterprise: Some(api(6_000, 100.0)),
                    },
                },
            ],
            default: RoutePlanRule {
                route_prefix: "default".to_string(),
                algorithm: Algorithm::TokenBucket,
                rules: PlanRules {
                    free: fallback(100),
                    pro: Some(fallback(300)),
                    enterprise: Some(fallback(1_000)),
                },
            },
        }
    }
}
