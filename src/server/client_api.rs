//! Client API endpoints for license checks and session lifecycle.
//!
//! # Endpoints
//!
//! - `POST /api/v1/session` - Present a license key and open a session
//! - `DELETE /api/v1/session` - End a session
//! - `POST /api/v1/session/keepalive` - Refresh a session
//! - `POST /api/v1/key_info` - Describe a license key
//!
//! A denied check is a normal answer, not an error: the body keeps the
//! `CheckKeyResponse` shape and only the HTTP status changes. Unreadable
//! bodies are rejected with the `ApiError` envelope.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::authority::{CheckOutcome, DenialReason, KeepAliveOutcome, KeyInfo, KeyStatus};
use crate::server::api_error::ApiError;
use crate::server::handlers::AppState;
use crate::server::validation::{validate_fingerprint, validate_license_key, validate_session_id};

/// HTTP status used for a key status.
pub fn status_code_for(status: KeyStatus) -> StatusCode {
    match status {
        KeyStatus::Granted => StatusCode::OK,
        KeyStatus::NotFound => StatusCode::NOT_FOUND,
        KeyStatus::Revoked | KeyStatus::Expired => StatusCode::FORBIDDEN,
        KeyStatus::ConcurrencyLimitExceeded | KeyStatus::InstallLimitExceeded => {
            StatusCode::CONFLICT
        }
        KeyStatus::FingerprintRequired => StatusCode::BAD_REQUEST,
        KeyStatus::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to check a license key.
#[derive(Debug, Deserialize, Serialize)]
pub struct CheckKeyRequest {
    pub license_key: String,
    /// Identifies the installation; required for keys with an install limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Response to a license key check, granted or not.
#[derive(Debug, Deserialize, Serialize)]
pub struct CheckKeyResponse {
    pub granted: bool,
    pub session_id: Option<String>,
    pub status: KeyStatus,
    pub message: String,
}

impl From<&CheckOutcome> for CheckKeyResponse {
    fn from(outcome: &CheckOutcome) -> Self {
        let status = outcome.status();
        Self {
            granted: outcome.is_granted(),
            session_id: outcome.session().map(|s| s.id.clone()),
            status,
            message: status.message().to_string(),
        }
    }
}

impl IntoResponse for CheckKeyResponse {
    fn into_response(self) -> Response {
        (status_code_for(self.status), Json(self)).into_response()
    }
}

/// Request referring to an existing session.
#[derive(Debug, Deserialize, Serialize)]
pub struct SessionRequest {
    pub session_id: String,
}

/// Response to an end-session request.
#[derive(Debug, Deserialize, Serialize)]
pub struct EndSessionResponse {
    pub acknowledged: bool,
}

/// Response to a keep-alive.
#[derive(Debug, Deserialize, Serialize)]
pub struct KeepAliveResponse {
    pub success: bool,
    /// When the session expires unless refreshed again
    pub expires_at: Option<String>,
    /// Why the session was terminated, if it was
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Request for key information.
#[derive(Debug, Deserialize, Serialize)]
pub struct KeyInfoRequest {
    pub license_key: String,
}

/// Response to a key information request.
#[derive(Debug, Deserialize, Serialize)]
pub struct KeyInfoResponse {
    pub found: bool,
    pub status: KeyStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<KeyInfo>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Check a license key and open a session for it.
///
/// # Behavior
/// - Unknown key -> 404 `NOT_FOUND`
/// - Revoked or expired key -> 403
/// - Install-limited key without a fingerprint -> 400 `FINGERPRINT_REQUIRED`
/// - All session or installation slots in use -> 409
/// - Record store unreachable or slow -> 503 `UNAVAILABLE`
/// - Otherwise -> 200 with the new `session_id`
pub async fn check_key_handler(
    State(state): State<AppState>,
    payload: Result<Json<CheckKeyRequest>, JsonRejection>,
) -> Result<CheckKeyResponse, ApiError> {
    let Json(req) = payload?;
    validate_license_key(&req.license_key, "license_key")?;
    if let Some(fingerprint) = &req.fingerprint {
        validate_fingerprint(fingerprint, "fingerprint")?;
    }

    let outcome = state
        .authority
        .check_install(&req.license_key, req.fingerprint.as_deref())
        .await;
    Ok(CheckKeyResponse::from(&outcome))
}

/// End a session.
///
/// Always acknowledged, even if the session is unknown, was already closed
/// or the id could never have been issued.
pub async fn end_session_handler(
    State(state): State<AppState>,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> Result<Json<EndSessionResponse>, ApiError> {
    let Json(req) = payload?;

    let acknowledged = match validate_session_id(&req.session_id, "session_id") {
        Ok(()) => state.authority.end_session(&req.session_id).acknowledged(),
        Err(err) => {
            debug!("End requested for malformed session id: {err}");
            true
        }
    };

    Ok(Json(EndSessionResponse { acknowledged }))
}

/// Refresh a session.
///
/// # Behavior
/// - Active session -> 200 with the new expiry
/// - Unknown, closed or timed-out session -> 404 `SESSION_NOT_FOUND`
/// - Key revoked or expired since the session opened -> session terminated,
///   403 with the reason
pub async fn keep_alive_handler(
    State(state): State<AppState>,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    validate_session_id(&req.session_id, "session_id")?;

    match state.authority.keep_alive(&req.session_id).await {
        KeepAliveOutcome::Alive(session) => Ok(Json(KeepAliveResponse {
            success: true,
            expires_at: Some(session.expires_at().to_rfc3339()),
            reason: None,
            message: None,
        })
        .into_response()),
        KeepAliveOutcome::NotFound => Err(ApiError::session_not_found()),
        KeepAliveOutcome::Terminated(reason) => {
            let status = status_code_for(KeyStatus::from(reason));
            let body = KeepAliveResponse {
                success: false,
                expires_at: None,
                reason: Some(reason),
                message: Some(reason.message().to_string()),
            };
            Ok((status, Json(body)).into_response())
        }
    }
}

/// Describe a license key.
pub async fn key_info_handler(
    State(state): State<AppState>,
    payload: Result<Json<KeyInfoRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    validate_license_key(&req.license_key, "license_key")?;

    let (status, body) = match state.authority.key_info(&req.license_key).await {
        Ok(info) => (
            StatusCode::OK,
            KeyInfoResponse {
                found: true,
                status: KeyStatus::Granted,
                message: "License key found".to_string(),
                info: Some(info),
            },
        ),
        Err(reason) => {
            let status = KeyStatus::from(reason);
            (
                status_code_for(status),
                KeyInfoResponse {
                    found: false,
                    status,
                    message: reason.message().to_string(),
                    info: None,
                },
            )
        }
    };

    Ok((status, Json(body)).into_response())
}
