use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use tracing::warn;

use crate::authority::LicenseAuthority;
use crate::server::logging::HealthResponse;

/// Shared application state for handlers.
///
/// The authority owns the record cache and the session registry; handlers
/// never reach the store directly.
#[derive(Clone)]
pub struct AppState {
    pub authority: Arc<LicenseAuthority>,
}

impl AppState {
    pub fn new(authority: Arc<LicenseAuthority>) -> Self {
        Self { authority }
    }
}

/// Health check handler.
///
/// Returns 200 when the record store answers a ping within the store
/// timeout, 503 otherwise. The body has the same shape either way.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.authority.store();
    let connected = state.authority.store_reachable().await;

    if !connected {
        warn!(backend = store.backend_name(), "Health check: record store unreachable");
    }

    let health = HealthResponse::new(
        connected,
        store.backend_name(),
        state.authority.active_sessions(),
    );

    let status = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(health))
}
