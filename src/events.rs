//! Structured audit logging for session lifecycle events.

use tracing::{info, info_span, warn};

use crate::license::key_fingerprint;

/// Session lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A check succeeded and a session was opened
    Granted,
    /// A check was denied
    Denied,
    /// A session was ended by its client
    Closed,
    /// A session timed out (sweep or keep-alive after timeout)
    Expired,
    /// A keep-alive found the key revoked or expired and terminated the session
    Terminated,
    /// A keep-alive refreshed a session
    KeptAlive,
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionEvent::Granted => "granted",
            SessionEvent::Denied => "denied",
            SessionEvent::Closed => "closed",
            SessionEvent::Expired => "expired",
            SessionEvent::Terminated => "terminated",
            SessionEvent::KeptAlive => "kept_alive",
        };
        write!(f, "{}", s)
    }
}

/// Log a session lifecycle event.
///
/// The license key is logged as a fingerprint only.
///
/// # Arguments
///
/// * `event` - The type of session event
/// * `key` - The license key involved
/// * `session_id` - The session, when one exists
/// * `details` - Optional reason or extra context
pub fn log_session_event(
    event: SessionEvent,
    key: &str,
    session_id: Option<&str>,
    details: Option<&str>,
) {
    let span = info_span!(
        "session_event",
        event = %event,
        key = %key_fingerprint(key),
        session_id = session_id.unwrap_or("-"),
    );
    let _enter = span.enter();

    match event {
        SessionEvent::Denied | SessionEvent::Terminated => {
            if let Some(d) = details {
                warn!(reason = %d, "Session event occurred");
            } else {
                warn!("Session event occurred");
            }
        }
        _ => {
            if let Some(d) = details {
                info!(details = %d, "Session event occurred");
            } else {
                info!("Session event occurred");
            }
        }
    }
}
