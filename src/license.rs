//! License records as seen by the session authority.
//!
//! A [`LicenseRecord`] is owned by the record store. The authority reads it to
//! decide whether a key may open another session and to report key information
//! back to clients. Its only writes are the first-activation stamp and the
//! installation bindings, both made through the store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Entitlement attached to a license key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRecord {
    /// The license key itself (opaque credential)
    pub key: String,
    /// How many sessions may be open at the same time
    pub max_concurrent_sessions: u32,
    /// Optional validity end; `None` means the key never expires
    pub expires_at: Option<DateTime<Utc>>,
    /// Revocation flag; `false` means the key was administratively disabled
    pub active: bool,
    /// How many distinct installations may use the key; `None` is unlimited
    pub install_limit: Option<u32>,
    /// When the key first opened a session
    pub activated_at: Option<DateTime<Utc>>,
    /// Validity counted from activation, in seconds
    pub validity_secs: Option<u64>,
}

impl LicenseRecord {
    /// A non-expiring, active record.
    pub fn new(key: impl Into<String>, max_concurrent_sessions: u32) -> Self {
        Self {
            key: key.into(),
            max_concurrent_sessions,
            expires_at: None,
            active: true,
            install_limit: None,
            activated_at: None,
            validity_secs: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_install_limit(mut self, limit: u32) -> Self {
        self.install_limit = Some(limit);
        self
    }

    /// Validity that starts running on first activation.
    pub fn with_validity(mut self, validity_secs: u64) -> Self {
        self.validity_secs = Some(validity_secs);
        self
    }

    pub fn activated(mut self, at: DateTime<Utc>) -> Self {
        self.activated_at = Some(at);
        self
    }

    pub fn revoked(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// End of the activation-relative validity, if one applies.
    ///
    /// A key that was never activated has not started its period yet.
    pub fn validity_ends_at(&self) -> Option<DateTime<Utc>> {
        let activated_at = self.activated_at?;
        let secs = i64::try_from(self.validity_secs?).ok()?;
        Duration::try_seconds(secs).and_then(|period| activated_at.checked_add_signed(period))
    }

    /// Effective end of validity: the earlier of the fixed expiry and the
    /// activation-relative one.
    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        match (self.expires_at, self.validity_ends_at()) {
            (Some(fixed), Some(relative)) => Some(fixed.min(relative)),
            (fixed, relative) => fixed.or(relative),
        }
    }

    /// Whether the record's validity ends at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.ends_at(), Some(end) if end <= now)
    }
}

/// Short, stable fingerprint of a license key for logs.
///
/// Keys are credentials, so they never appear verbatim in log output.
pub fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..6])
}
