//! Axum middleware that applies rate limits to every request.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, instrument};

use crate::config::FailurePolicy;
use crate::ratelimit::{ClientKey, PlanRegistry, PlanTier, RateLimitResult, RateLimiter, RuleCatalog};

/// Request header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const RATE_LIMIT_PLAN: HeaderName = HeaderName::from_static("x-ratelimit-plan");

/// Everything the middleware needs, shared by all requests.
#[derive(Clone)]
pub struct RateLimitState {
    limiter: RateLimiter,
    rules: Arc<RuleCatalog>,
    plans: Arc<PlanRegistry>,
    failure_policy: FailurePolicy,
}

impl RateLimitState {
    /// Create middleware state that fails open.
    pub fn new(limiter: RateLimiter, rules: RuleCatalog, plans: PlanRegistry) -> Self {
        Self {
            limiter,
            rules: Arc::new(rules),
            plans: Arc::new(plans),
            failure_policy: FailurePolicy::Open,
        }
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }
}

/// Rate limit a request before handing it to the rest of the stack.
///
/// Allowed responses carry the `X-RateLimit-*` headers; denied requests get
/// a 429 with the same headers. When the limiter fails, the configured
/// [`FailurePolicy`] decides between passing the request through and a 503.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let client = ClientKey::from_parts(api_key, peer);
    let plan = state.plans.resolve(api_key);
    let resolved = state.rules.resolve(request.uri().path(), plan);

    let result = state
        .limiter
        .check_and_consume(client.as_str(), resolved.rule, resolved.algorithm)
        .await;

    match result {
        Ok(decision) if decision.allowed => {
            let limit = resolved.rule.max_requests;
            let mut response = next.run(request).await;
            apply_headers(response.headers_mut(), limit, &decision, plan);
            response
        }
        Ok(decision) => {
            debug!(
                client = %client,
                plan = %plan,
                route = %resolved.route_prefix,
                "Rejecting request over rate limit"
            );
            let mut response = too_many_requests();
            apply_headers(response.headers_mut(), resolved.rule.max_requests, &decision, plan);
            response
        }
        Err(e) => {
            error!(
                client = %client,
                error = %e,
                policy = ?state.failure_policy,
                "Rate limiter error"
            );
            match state.failure_policy {
                FailurePolicy::Open => next.run(request).await,
                FailurePolicy::Closed => limiter_unavailable(),
            }
        }
    }
}

fn apply_headers(headers: &mut HeaderMap, limit: u64, decision: &RateLimitResult, plan: PlanTier) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(decision.reset_at));
    headers.insert(RATE_LIMIT_PLAN, HeaderValue::from_static(plan.as_str()));
}

fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({
            "error": "too_many_requests",
            "message": "Rate limit exceeded. Please try again later.",
        })),
    )
        .into_response()
}

fn limiter_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({
            "error": "rate_limiter_unavailable",
            "message": "Rate limiting is temporarily unavailable. Please try again later.",
        })),
    )
        .into_response()
}
