//! The license authority: turns a presented key into a grant or a denial and
//! drives the session lifecycle.
//!
//! # Check flow
//!
//! 1. record absent -> `Denied(NotFound)`
//! 2. record inactive -> `Denied(Revoked)`
//! 3. record past its expiry -> `Denied(Expired)`
//! 4. install limit set but no fingerprint -> `Denied(FingerprintRequired)`
//! 5. new fingerprint with every install slot taken -> `Denied(InstallLimitExceeded)`
//! 6. no free slot -> `Denied(ConcurrencyLimitExceeded)`
//! 7. otherwise -> `Granted(session)`, stamping the first activation
//!
//! Store failures, store timeouts and corrupt records become
//! `Denied(Unavailable)`. Nothing on this path panics or returns a fault to
//! the caller.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cache::LicenseCache;
use crate::config::{SessionConfig, MAX_SESSION_TIMEOUT_SECS};
use crate::errors::LicenseError;
use crate::events::{log_session_event, SessionEvent};
use crate::license::{key_fingerprint, LicenseRecord};
use crate::registry::{SessionRegistry, Touch};
use crate::session::Session;
use crate::store::{InstallOutcome, LicenseStore};

/// Why a check (or a keep-alive) was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
    /// Key is unknown to the record store
    NotFound,
    /// Key was administratively disabled
    Revoked,
    /// Key is past its validity date
    Expired,
    /// Every entitlement slot is in use
    ConcurrencyLimitExceeded,
    /// The key limits installations and the request named none
    FingerprintRequired,
    /// The fingerprint is new and every installation slot is taken
    InstallLimitExceeded,
    /// Record store or registry could not answer in time
    Unavailable,
}

impl DenialReason {
    pub fn message(&self) -> &'static str {
        match self {
            DenialReason::NotFound => "License key not found",
            DenialReason::Revoked => "License key has been revoked",
            DenialReason::Expired => "License key has expired",
            DenialReason::ConcurrencyLimitExceeded => {
                "All sessions allowed for this license key are in use"
            }
            DenialReason::FingerprintRequired => {
                "This license key requires an installation fingerprint"
            }
            DenialReason::InstallLimitExceeded => {
                "All installations allowed for this license key are in use"
            }
            DenialReason::Unavailable => "License service is temporarily unavailable",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Status reported to clients: `GRANTED` or one of the denial reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    Granted,
    NotFound,
    Revoked,
    Expired,
    ConcurrencyLimitExceeded,
    FingerprintRequired,
    InstallLimitExceeded,
    Unavailable,
}

impl KeyStatus {
    pub fn message(&self) -> &'static str {
        match self {
            KeyStatus::Granted => "Access granted",
            KeyStatus::NotFound => DenialReason::NotFound.message(),
            KeyStatus::Revoked => DenialReason::Revoked.message(),
            KeyStatus::Expired => DenialReason::Expired.message(),
            KeyStatus::ConcurrencyLimitExceeded => {
                DenialReason::ConcurrencyLimitExceeded.message()
            }
            KeyStatus::FingerprintRequired => DenialReason::FingerprintRequired.message(),
            KeyStatus::InstallLimitExceeded => DenialReason::InstallLimitExceeded.message(),
            KeyStatus::Unavailable => DenialReason::Unavailable.message(),
        }
    }
}

impl From<DenialReason> for KeyStatus {
    fn from(reason: DenialReason) -> Self {
        match reason {
            DenialReason::NotFound => KeyStatus::NotFound,
            DenialReason::Revoked => KeyStatus::Revoked,
            DenialReason::Expired => KeyStatus::Expired,
            DenialReason::ConcurrencyLimitExceeded => KeyStatus::ConcurrencyLimitExceeded,
            DenialReason::FingerprintRequired => KeyStatus::FingerprintRequired,
            DenialReason::InstallLimitExceeded => KeyStatus::InstallLimitExceeded,
            DenialReason::Unavailable => KeyStatus::Unavailable,
        }
    }
}

/// Result of [`LicenseAuthority::check_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Granted(Session),
    Denied(DenialReason),
}

impl CheckOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, CheckOutcome::Granted(_))
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            CheckOutcome::Granted(session) => Some(session),
            CheckOutcome::Denied(_) => None,
        }
    }

    pub fn denial(&self) -> Option<DenialReason> {
        match self {
            CheckOutcome::Granted(_) => None,
            CheckOutcome::Denied(reason) => Some(*reason),
        }
    }

    pub fn status(&self) -> KeyStatus {
        match self {
            CheckOutcome::Granted(_) => KeyStatus::Granted,
            CheckOutcome::Denied(reason) => (*reason).into(),
        }
    }
}

/// Result of [`LicenseAuthority::end_session`].
///
/// Either way the client's "I am done" is satisfied, so both variants are
/// acknowledged; the distinction only matters for logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndOutcome {
    Closed(Session),
    AlreadyGone,
}

impl EndOutcome {
    pub fn acknowledged(&self) -> bool {
        true
    }
}

/// Result of [`LicenseAuthority::keep_alive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveOutcome {
    /// Session refreshed; carries the updated snapshot
    Alive(Session),
    /// Unknown, closed or timed-out session
    NotFound,
    /// The key stopped being valid; the session has been terminated
    Terminated(DenialReason),
}

/// Key information reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key: String,
    pub active: bool,
    /// Effective end of validity, fixed or counted from activation
    pub expires_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub max_concurrent_sessions: u32,
    pub active_sessions: usize,
    pub install_limit: Option<u32>,
    pub installs: u32,
}

/// Tunables of the authority.
#[derive(Debug, Clone)]
pub struct AuthoritySettings {
    /// Idle time after which a session expires
    pub session_timeout: Duration,
    /// How long a record may be served from cache
    pub cache_ttl: StdDuration,
    /// Upper bound on one record store call
    pub store_timeout: StdDuration,
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for AuthoritySettings {
    fn from(config: &SessionConfig) -> Self {
        let timeout_secs = config.timeout_secs.min(MAX_SESSION_TIMEOUT_SECS) as i64;
        Self {
            session_timeout: Duration::try_seconds(timeout_secs).unwrap_or(Duration::MAX),
            cache_ttl: config.cache_ttl(),
            store_timeout: config.store_timeout(),
        }
    }
}

/// Single entry point for session decisions.
///
/// Cheap to share: wrap it in an `Arc` and hand it to every request handler
/// and to the background jobs.
pub struct LicenseAuthority {
    cache: LicenseCache,
    registry: SessionRegistry,
    session_timeout: Duration,
}

impl LicenseAuthority {
    pub fn new(store: Arc<dyn LicenseStore>, settings: AuthoritySettings) -> Self {
        Self {
            cache: LicenseCache::new(store, settings.cache_ttl, settings.store_timeout),
            registry: SessionRegistry::new(),
            session_timeout: settings.session_timeout,
        }
    }

    /// Validate `key` and, if allowed, open a session for it.
    pub async fn check_key(&self, key: &str) -> CheckOutcome {
        self.check_install(key, None).await
    }

    /// Like [`check_key`](Self::check_key), on behalf of one installation.
    ///
    /// Keys with an install limit require a fingerprint. A fingerprint seen
    /// before always passes; a new one takes a free installation slot.
    pub async fn check_install(&self, key: &str, fingerprint: Option<&str>) -> CheckOutcome {
        let outcome = match self.lookup(key).await {
            Ok(record) => self.open_for(&record, fingerprint).await,
            Err(reason) => CheckOutcome::Denied(reason),
        };

        match &outcome {
            CheckOutcome::Granted(session) => {
                log_session_event(SessionEvent::Granted, key, Some(&session.id), None)
            }
            CheckOutcome::Denied(reason) => {
                log_session_event(SessionEvent::Denied, key, None, Some(&format!("{reason:?}")))
            }
        }

        outcome
    }

    async fn open_for(&self, record: &LicenseRecord, fingerprint: Option<&str>) -> CheckOutcome {
        if let Err(reason) = evaluate(record, Utc::now()) {
            return CheckOutcome::Denied(reason);
        }
        if let Err(reason) = self.bind_install(record, fingerprint).await {
            return CheckOutcome::Denied(reason);
        }

        let Some(session) = self.registry.try_open(
            &record.key,
            record.max_concurrent_sessions,
            self.session_timeout,
        ) else {
            return CheckOutcome::Denied(DenialReason::ConcurrencyLimitExceeded);
        };

        if record.activated_at.is_none() {
            // The session stands even if the stamp fails; the next grant retries.
            if let Err(e) = self.cache.mark_activated(&record.key, session.opened_at).await {
                warn!(key = %key_fingerprint(&record.key), "Failed to record activation: {e}");
            }
        }

        CheckOutcome::Granted(session)
    }

    async fn bind_install(
        &self,
        record: &LicenseRecord,
        fingerprint: Option<&str>,
    ) -> Result<(), DenialReason> {
        let Some(fingerprint) = fingerprint else {
            return match record.install_limit {
                Some(_) => Err(DenialReason::FingerprintRequired),
                None => Ok(()),
            };
        };

        match self
            .cache
            .register_install(&record.key, fingerprint, record.install_limit)
            .await
        {
            Ok(InstallOutcome::Known) => Ok(()),
            Ok(InstallOutcome::Registered) => {
                info!(key = %key_fingerprint(&record.key), "New installation registered");
                Ok(())
            }
            Ok(InstallOutcome::LimitReached) => Err(DenialReason::InstallLimitExceeded),
            Err(e) => {
                warn!(key = %key_fingerprint(&record.key), "Install registration failed: {e}");
                Err(DenialReason::Unavailable)
            }
        }
    }

    /// End a session. Always acknowledged.
    pub fn end_session(&self, session_id: &str) -> EndOutcome {
        match self.registry.close(session_id) {
            Some(session) => {
                log_session_event(SessionEvent::Closed, &session.key_id, Some(&session.id), None);
                EndOutcome::Closed(session)
            }
            None => {
                debug!(
                    session_id = %session_id,
                    "End requested for unknown or already terminated session"
                );
                EndOutcome::AlreadyGone
            }
        }
    }

    /// Refresh a session and re-check its key.
    ///
    /// If the key was revoked or expired since the session opened, the session
    /// is terminated and the reason is returned. A record store outage does
    /// not terminate live sessions.
    pub async fn keep_alive(&self, session_id: &str) -> KeepAliveOutcome {
        let session = match self.registry.touch(session_id) {
            Touch::Refreshed(session) => session,
            Touch::Expired(session) => {
                log_session_event(
                    SessionEvent::Expired,
                    &session.key_id,
                    Some(&session.id),
                    Some("keep-alive after timeout"),
                );
                return KeepAliveOutcome::NotFound;
            }
            Touch::NotFound => return KeepAliveOutcome::NotFound,
        };

        let verdict = match self.lookup(&session.key_id).await {
            Ok(record) => evaluate(&record, Utc::now()),
            Err(DenialReason::Unavailable) => {
                warn!(
                    session_id = %session.id,
                    "Record store unavailable during keep-alive; keeping session"
                );
                Ok(())
            }
            Err(reason) => Err(reason),
        };

        match verdict {
            Ok(()) => {
                log_session_event(SessionEvent::KeptAlive, &session.key_id, Some(&session.id), None);
                KeepAliveOutcome::Alive(session)
            }
            Err(reason) => match self.registry.expire(&session.id) {
                Some(terminated) => {
                    log_session_event(
                        SessionEvent::Terminated,
                        &terminated.key_id,
                        Some(&terminated.id),
                        Some(&format!("{reason:?}")),
                    );
                    KeepAliveOutcome::Terminated(reason)
                }
                None => {
                    debug!(
                        session_id = %session.id,
                        "Session ended while its key was re-checked"
                    );
                    KeepAliveOutcome::NotFound
                }
            },
        }
    }

    /// Describe a key and how many of its slots are in use.
    pub async fn key_info(&self, key: &str) -> Result<KeyInfo, DenialReason> {
        let record = self.lookup(key).await?;
        let installs = self.cache.install_count(&record.key).await.map_err(|e| {
            warn!(key = %key_fingerprint(key), "Install count failed: {e}");
            DenialReason::Unavailable
        })?;

        Ok(KeyInfo {
            active_sessions: self.registry.count_active(&record.key),
            expires_at: record.ends_at(),
            activated_at: record.activated_at,
            install_limit: record.install_limit,
            installs,
            active: record.active,
            max_concurrent_sessions: record.max_concurrent_sessions,
            key: record.key,
        })
    }

    /// Whether the record store answers a ping within the store timeout.
    pub async fn store_reachable(&self) -> bool {
        self.cache.ping().await
    }

    /// Expire every timed-out session. Returns how many were reaped.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let reaped = self.registry.drain_expired(now);
        for session in &reaped {
            log_session_event(SessionEvent::Expired, &session.key_id, Some(&session.id), None);
        }
        reaped.len()
    }

    /// Drop stale record cache entries. Returns how many were dropped.
    pub fn purge_cache(&self) -> usize {
        self.cache.purge_stale()
    }

    /// Close every open session; called when the server stops.
    pub fn shutdown(&self) -> usize {
        let closed = self.registry.close_all();
        info!(closed, "Closed all open sessions on shutdown");
        closed
    }

    /// Active sessions currently counted against `key`.
    pub fn count_active(&self, key: &str) -> usize {
        self.registry.count_active(key)
    }

    /// Active sessions across all keys.
    pub fn active_sessions(&self) -> usize {
        self.registry.total_active()
    }

    pub fn store(&self) -> &Arc<dyn LicenseStore> {
        self.cache.store()
    }

    async fn lookup(&self, key: &str) -> Result<LicenseRecord, DenialReason> {
        match self.cache.get(key).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(DenialReason::NotFound),
            Err(LicenseError::InvalidRecord(msg)) => {
                error!(key = %key_fingerprint(key), "Refusing corrupt license record: {msg}");
                Err(DenialReason::Unavailable)
            }
            Err(e) => {
                warn!(key = %key_fingerprint(key), "License lookup failed: {e}");
                Err(DenialReason::Unavailable)
            }
        }
    }
}

/// Revocation and expiry checks shared by check and keep-alive.
fn evaluate(record: &LicenseRecord, now: DateTime<Utc>) -> Result<(), DenialReason> {
    if !record.is_active() {
        return Err(DenialReason::Revoked);
    }
    if record.is_expired_at(now) {
        return Err(DenialReason::Expired);
    }
    Ok(())
}
