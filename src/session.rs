//! Session values handed out by the registry.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Prefix on every session token, for easy identification in client logs.
pub const SESSION_ID_PREFIX: &str = "ks_";

/// Random bytes behind a session token (hex-encoded after the prefix).
const SESSION_ID_BYTES: usize = 32;

/// Lifecycle state of a session.
///
/// Only `Active` sessions live in the registry. `Closed` and `Expired` are
/// terminal and only appear on the snapshot returned when a session leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Closed,
    Expired,
}

/// One open grant of access tied to a license key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque, unpredictable token
    pub id: String,
    /// License key this session counts against (lookup only)
    pub key_id: String,
    pub opened_at: DateTime<Utc>,
    /// Refreshed by keep-alives; drives expiry
    pub last_seen_at: DateTime<Utc>,
    /// Idle time after which the session expires
    pub timeout: Duration,
    pub state: SessionState,
}

impl Session {
    pub(crate) fn open(key_id: &str, timeout: Duration, now: DateTime<Utc>) -> Self {
        Self {
            id: generate_session_id(),
            key_id: key_id.to_string(),
            opened_at: now,
            last_seen_at: now,
            timeout,
            state: SessionState::Active,
        }
    }

    /// Moment after which the session counts as expired.
    ///
    /// Saturates at the end of representable time instead of overflowing.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_seen_at
            .checked_add_signed(self.timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// `last_seen_at + timeout < now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() < now
    }
}

/// Generate a session token from the thread-local CSPRNG.
///
/// Tokens are never sequential: guessing one means guessing 256 random bits.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    format!("{SESSION_ID_PREFIX}{}", hex::encode(bytes))
}

/// Length of a well-formed session token.
pub const SESSION_ID_LEN: usize = SESSION_ID_PREFIX.len() + SESSION_ID_BYTES * 2;
