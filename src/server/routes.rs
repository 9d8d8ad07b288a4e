use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;

use crate::server::client_api::{
    check_key_handler, end_session_handler, keep_alive_handler, key_info_handler,
};
use crate::server::handlers::{health_handler, AppState};
use crate::server::logging::request_logging_middleware;

/// Build the main application router for the Keyseat server.
///
/// This is a convenience helper so `main.rs` or tests can
/// construct the router in a single call.
///
/// # Routes
///
/// - `POST /api/v1/session` - Check a license key and open a session
/// - `DELETE /api/v1/session` - End a session
/// - `POST /api/v1/session/keepalive` - Refresh a session
/// - `POST /api/v1/key_info` - Describe a license key
/// - `GET /health` - Liveness and record store status
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/session",
            post(check_key_handler).delete(end_session_handler),
        )
        .route("/api/v1/session/keepalive", post(keep_alive_handler))
        .route("/api/v1/key_info", post(key_info_handler))
        .route("/health", get(health_handler))
        .layer(ServiceBuilder::new().layer(middleware::from_fn(request_logging_middleware)))
        .with_state(state)
}
