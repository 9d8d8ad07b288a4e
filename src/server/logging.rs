//! Request logging middleware and health reporting.
//!
//! Every request gets a unique id, a tracing span, a timing line on completion
//! and an `X-Request-Id` response header.
//!
//! # Usage
//!
//! ```rust,ignore
//! use axum::middleware;
//! use keyseat::server::logging::request_logging_middleware;
//!
//! let app = Router::new()
//!     .route("/health", get(health_handler))
//!     .layer(middleware::from_fn(request_logging_middleware));
//! ```

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderValue, Response},
    middleware::Next,
};
use std::time::Instant;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Header name for the request ID.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Generate a new unique request ID.
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},sqlx=warn")));

    // A subscriber may already be installed (tests, embedding applications).
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Logging middleware that tracks request timing and generates request IDs.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response<Body> {
    let request_id = generate_request_id();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %path,
    );

    let start = Instant::now();

    let response = async move {
        info!("Started processing request");
        next.run(request).await
    }
    .instrument(span.clone())
    .await;

    let duration = start.elapsed();
    let status = response.status();

    let _enter = span.enter();
    info!(
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        "Request completed"
    );

    let (mut parts, body) = response.into_parts();
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        parts.headers.insert(REQUEST_ID_HEADER, header_value);
    }

    Response::from_parts(parts, body)
}

/// Health check response structure.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthResponse {
    /// Service status ("healthy" or "degraded")
    pub status: String,
    /// Service name
    pub service: String,
    /// Service version
    pub version: String,
    /// Record store status
    pub store: StoreHealth,
    /// Sessions currently open across all keys
    pub active_sessions: usize,
}

/// Record store health status.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoreHealth {
    /// Whether the store answered a ping
    pub connected: bool,
    /// Store backend (sqlite, postgres or memory)
    pub backend: String,
}

impl HealthResponse {
    pub fn new(store_connected: bool, backend: &str, active_sessions: usize) -> Self {
        Self {
            status: if store_connected { "healthy" } else { "degraded" }.to_string(),
            service: "keyseat".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            store: StoreHealth {
                connected: store_connected,
                backend: backend.to_string(),
            },
            active_sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_valid_uuid() {
        let id = generate_request_id();
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn health_response_healthy() {
        let health = HealthResponse::new(true, "sqlite", 3);
        assert_eq!(health.status, "healthy");
        assert_eq!(health.service, "keyseat");
        assert_eq!(health.active_sessions, 3);
        assert!(health.store.connected);
    }

    #[test]
    fn health_response_degraded() {
        let health = HealthResponse::new(false, "postgres", 0);
        assert_eq!(health.status, "degraded");
        assert!(!health.store.connected);
    }
}
