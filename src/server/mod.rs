// src/server/mod.rs

//! Server-side components for Keyseat.
//!
//! This module contains:
//! - `database`    → SQL record store over SQLite/Postgres
//! - `handlers`    → Shared state and the health endpoint
//! - `client_api`  → Session endpoints (check, end, keep-alive, key info)
//! - `routes`      → Router builder
//! - `logging`     → Request logging middleware and tracing setup
//! - `api_error`   → Standardized error responses
//! - `validation`  → Request validation utilities

pub mod api_error;
pub mod client_api;
pub mod database;
pub mod handlers;
pub mod logging;
pub mod routes;
pub mod validation;

// Convenient re-exports so callers can do `keyseat::server::X`
// instead of digging into submodules.

pub use api_error::{ApiError, ErrorCode};
pub use client_api::{
    check_key_handler, end_session_handler, keep_alive_handler, key_info_handler,
    CheckKeyRequest, CheckKeyResponse, EndSessionResponse, KeepAliveResponse, KeyInfoRequest,
    KeyInfoResponse, SessionRequest,
};
pub use database::Database;
pub use handlers::{health_handler, AppState};
pub use logging::{init_tracing, request_logging_middleware, HealthResponse};
pub use routes::build_router;
pub use validation::{
    validate_license_key, validate_not_empty, validate_session_id, ValidationError,
    ValidationResult,
};
