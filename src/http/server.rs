//! HTTP server implementation.

use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, RateLimitState};
use crate::error::Result;

/// Build the demo application with rate limiting applied to every route.
pub fn router(state: RateLimitState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/login", get(login))
        .route("/api/data", get(api_data))
        .layer(middleware::from_fn_with_state(state, rate_limit))
}

async fn index() -> &'static str {
    "Rate Limiter is running. Try /health, /login, or /api/data"
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn login() -> Json<Value> {
    Json(json!({ "message": "Login endpoint (fixed-window)" }))
}

async fn api_data() -> Json<Value> {
    Json(json!({ "message": "Data endpoint (token bucket)" }))
}

/// HTTP server for the rate limited application.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Middleware state shared by all connections
    state: RateLimitState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: RateLimitState) -> Self {
        Self { addr, state }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(
            addr = %listener.local_addr()?,
            "Starting HTTP server with graceful shutdown"
        );

        let app = router(self.state);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{MemoryStore, PlanRegistry, RateLimiter, RuleCatalog};
    use std::sync::Arc;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let state = RateLimitState::new(limiter, RuleCatalog::default(), PlanRegistry::default());
        let _server = HttpServer::new(addr, state);
    }
}
