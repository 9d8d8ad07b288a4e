//! In-memory registry of open sessions.
//!
//! Sessions are grouped per license key in a sharded map. The cap check and the
//! insert in [`SessionRegistry::try_open`] run under the same shard write guard,
//! so two concurrent opens for one key can never both take the last slot.
//!
//! A second map indexes session id -> key so that close and keep-alive do not
//! have to scan. Lock order is always `by_key` then `index`; no method holds an
//! `index` guard while acquiring a `by_key` one.
//!
//! Only `Active` sessions are stored. Leaving the registry is the transition to
//! `Closed` or `Expired`, and it happens at most once per session because only
//! one caller can remove it from its key's slot map.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, error};

use crate::session::{Session, SessionState};

/// Result of a keep-alive against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Touch {
    /// Session is active and `last_seen_at` was moved to now.
    Refreshed(Session),
    /// Session had already outlived its timeout; it has now been expired.
    Expired(Session),
    /// Unknown or already terminated session.
    NotFound,
}

/// Authoritative, concurrency-safe bookkeeping of open sessions per key.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_key: DashMap<String, HashMap<String, Session>>,
    index: DashMap<String, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for `key_id` if fewer than `cap` are active.
    pub fn try_open(&self, key_id: &str, cap: u32, timeout: Duration) -> Option<Session> {
        self.try_open_at(key_id, cap, timeout, Utc::now())
    }

    /// [`try_open`](Self::try_open) with an explicit clock.
    ///
    /// Sessions of this key that are already past their timeout are reclaimed
    /// before counting, so a stale slot never blocks a fresh client just
    /// because the sweep has not run yet.
    pub fn try_open_at(
        &self,
        key_id: &str,
        cap: u32,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Option<Session> {
        if cap == 0 {
            return None;
        }

        let mut slots = self.by_key.entry(key_id.to_string()).or_default();

        let index = &self.index;
        slots.retain(|id, session| {
            if session.is_expired_at(now) {
                index.remove(id);
                debug!(session_id = %id, "Reclaimed expired session on open");
                false
            } else {
                true
            }
        });

        if slots.len() >= cap as usize {
            return None;
        }

        let session = Session::open(key_id, timeout, now);
        self.index.insert(session.id.clone(), key_id.to_string());
        slots.insert(session.id.clone(), session.clone());

        Some(session)
    }

    /// Close an active session.
    ///
    /// Returns the closed snapshot, or `None` if the session is unknown or was
    /// already closed/expired. Repeating the call is harmless.
    pub fn close(&self, session_id: &str) -> Option<Session> {
        self.terminate(session_id, SessionState::Closed)
    }

    /// Expire an active session immediately (used when its key is revoked).
    pub fn expire(&self, session_id: &str) -> Option<Session> {
        self.terminate(session_id, SessionState::Expired)
    }

    fn terminate(&self, session_id: &str, state: SessionState) -> Option<Session> {
        let key_id = self.index.get(session_id)?.value().clone();

        let mut removed = None;
        let mut now_empty = false;
        match self.by_key.get_mut(&key_id) {
            Some(mut slots) => {
                removed = slots.remove(session_id);
                now_empty = slots.is_empty();
                self.index.remove(session_id);
            }
            None => {
                error!(session_id = %session_id, "Session index points at a missing key");
                self.index.remove(session_id);
            }
        }

        if now_empty {
            self.by_key.remove_if(&key_id, |_, slots| slots.is_empty());
        }

        match removed {
            Some(mut session) => {
                session.state = state;
                Some(session)
            }
            None => {
                // A concurrent terminate won the race, or the index drifted.
                debug!(session_id = %session_id, "Session already gone on terminate");
                None
            }
        }
    }

    /// Refresh `last_seen_at` of an active session.
    pub fn touch(&self, session_id: &str) -> Touch {
        self.touch_at(session_id, Utc::now())
    }

    pub fn touch_at(&self, session_id: &str, now: DateTime<Utc>) -> Touch {
        let key_id = match self.index.get(session_id) {
            Some(entry) => entry.value().clone(),
            None => return Touch::NotFound,
        };

        let expired = {
            let mut slots = match self.by_key.get_mut(&key_id) {
                Some(slots) => slots,
                None => {
                    error!(session_id = %session_id, "Session index points at a missing key");
                    self.index.remove(session_id);
                    return Touch::NotFound;
                }
            };
            match slots.get_mut(session_id) {
                Some(session) if session.is_expired_at(now) => true,
                Some(session) => {
                    session.last_seen_at = now;
                    return Touch::Refreshed(session.clone());
                }
                None => return Touch::NotFound,
            }
        };

        if expired {
            if let Some(session) = self.expire(session_id) {
                return Touch::Expired(session);
            }
        }
        Touch::NotFound
    }

    /// Expire every session whose `last_seen_at + timeout < now`.
    ///
    /// Returns the number of sessions reaped.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        self.drain_expired(now).len()
    }

    /// Like [`sweep_expired`](Self::sweep_expired) but hands back the expired
    /// snapshots so callers can log them.
    ///
    /// Shards are visited one at a time; a concurrent open waits for at most
    /// one shard's worth of work.
    pub fn drain_expired(&self, now: DateTime<Utc>) -> Vec<Session> {
        let mut reaped = Vec::new();
        let mut emptied = Vec::new();

        for mut entry in self.by_key.iter_mut() {
            let key_id = entry.key().clone();
            let slots = entry.value_mut();

            let expired_ids: Vec<String> = slots
                .values()
                .filter(|s| s.is_expired_at(now))
                .map(|s| s.id.clone())
                .collect();

            for id in expired_ids {
                if let Some(mut session) = slots.remove(&id) {
                    self.index.remove(&id);
                    session.state = SessionState::Expired;
                    reaped.push(session);
                }
            }

            if slots.is_empty() {
                emptied.push(key_id);
            }
        }

        for key_id in emptied {
            self.by_key.remove_if(&key_id, |_, slots| slots.is_empty());
        }

        reaped
    }

    /// Close every open session (server shutdown). Returns how many were open.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        let index = &self.index;
        self.by_key.retain(|_, slots| {
            for id in slots.keys() {
                index.remove(id);
            }
            closed += slots.len();
            false
        });
        closed
    }

    /// Active sessions currently counted against `key_id`.
    pub fn count_active(&self, key_id: &str) -> usize {
        self.by_key.get(key_id).map(|slots| slots.len()).unwrap_or(0)
    }

    /// Active sessions across all keys.
    pub fn total_active(&self) -> usize {
        self.by_key.iter().map(|slots| slots.len()).sum()
    }

    /// Snapshot of one active session.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let key_id = self.index.get(session_id)?.value().clone();
        let slots = self.by_key.get(&key_id)?;
        slots.get(session_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn timeout() -> Duration {
        Duration::seconds(60)
    }

    #[test]
    fn cap_is_enforced() {
        let registry = SessionRegistry::new();
        let a = registry.try_open("ABC", 2, timeout()).unwrap();
        let b = registry.try_open("ABC", 2, timeout()).unwrap();
        assert_ne!(a.id, b.id);
        assert!(registry.try_open("ABC", 2, timeout()).is_none());
        assert_eq!(registry.count_active("ABC"), 2);
    }

    #[test]
    fn zero_cap_never_opens() {
        let registry = SessionRegistry::new();
        assert!(registry.try_open("ABC", 0, timeout()).is_none());
        assert_eq!(registry.total_active(), 0);
    }

    #[test]
    fn keys_do_not_share_slots() {
        let registry = SessionRegistry::new();
        assert!(registry.try_open("A", 1, timeout()).is_some());
        assert!(registry.try_open("B", 1, timeout()).is_some());
        assert!(registry.try_open("A", 1, timeout()).is_none());
    }

    #[test]
    fn close_is_reported_once() {
        let registry = SessionRegistry::new();
        let s = registry.try_open("ABC", 1, timeout()).unwrap();

        let closed = registry.close(&s.id).unwrap();
        assert_eq!(closed.state, SessionState::Closed);
        assert!(registry.close(&s.id).is_none());
        assert!(registry.close("ks_unknown").is_none());
        assert_eq!(registry.count_active("ABC"), 0);
    }

    #[test]
    fn close_frees_a_slot() {
        let registry = SessionRegistry::new();
        let s = registry.try_open("ABC", 1, timeout()).unwrap();
        assert!(registry.try_open("ABC", 1, timeout()).is_none());
        registry.close(&s.id);
        assert!(registry.try_open("ABC", 1, timeout()).is_some());
    }

    #[test]
    fn sweep_reaps_only_expired() {
        let registry = SessionRegistry::new();
        let t0 = Utc::now();
        let short = registry
            .try_open_at("ABC", 3, Duration::seconds(5), t0)
            .unwrap();
        let long = registry
            .try_open_at("ABC", 3, Duration::seconds(60), t0)
            .unwrap();

        assert_eq!(registry.sweep_expired(t0 + Duration::seconds(5)), 0);
        assert_eq!(registry.sweep_expired(t0 + Duration::seconds(6)), 1);

        assert!(registry.get(&short.id).is_none());
        assert!(registry.get(&long.id).is_some());
        assert_eq!(registry.count_active("ABC"), 1);
        // Expired sessions can no longer be closed.
        assert!(registry.close(&short.id).is_none());
    }

    #[test]
    fn sweep_drops_empty_keys() {
        let registry = SessionRegistry::new();
        let t0 = Utc::now();
        registry.try_open_at("ABC", 1, Duration::seconds(1), t0);
        let reaped = registry.drain_expired(t0 + Duration::seconds(2));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].state, SessionState::Expired);
        assert_eq!(registry.total_active(), 0);
        assert!(registry.by_key.is_empty());
        assert!(registry.index.is_empty());
    }

    #[test]
    fn open_reclaims_stale_slots_for_its_key() {
        let registry = SessionRegistry::new();
        let t0 = Utc::now();
        let stale = registry
            .try_open_at("ABC", 1, Duration::seconds(1), t0)
            .unwrap();

        let fresh = registry
            .try_open_at("ABC", 1, Duration::seconds(1), t0 + Duration::seconds(5))
            .unwrap();
        assert_ne!(stale.id, fresh.id);
        assert!(registry.get(&stale.id).is_none());
    }

    #[test]
    fn touch_refreshes_and_extends_life() {
        let registry = SessionRegistry::new();
        let t0 = Utc::now();
        let s = registry
            .try_open_at("ABC", 1, Duration::seconds(10), t0)
            .unwrap();

        let t1 = t0 + Duration::seconds(8);
        match registry.touch_at(&s.id, t1) {
            Touch::Refreshed(session) => assert_eq!(session.last_seen_at, t1),
            other => panic!("unexpected touch result: {other:?}"),
        }

        // Would have expired without the touch.
        assert_eq!(registry.sweep_expired(t0 + Duration::seconds(15)), 0);
    }

    #[test]
    fn touch_after_timeout_expires_session() {
        let registry = SessionRegistry::new();
        let t0 = Utc::now();
        let s = registry
            .try_open_at("ABC", 1, Duration::seconds(10), t0)
            .unwrap();

        match registry.touch_at(&s.id, t0 + Duration::seconds(11)) {
            Touch::Expired(session) => assert_eq!(session.state, SessionState::Expired),
            other => panic!("unexpected touch result: {other:?}"),
        }
        assert_eq!(registry.touch_at(&s.id, t0), Touch::NotFound);
        assert_eq!(registry.count_active("ABC"), 0);
    }

    #[test]
    fn oversized_timeout_never_panics() {
        let registry = SessionRegistry::new();
        let t0 = Utc::now();
        let s = registry
            .try_open_at("ABC", 2, Duration::MAX, t0)
            .unwrap();
        assert!(registry.try_open_at("ABC", 2, Duration::MAX, t0).is_some());
        assert!(matches!(
            registry.touch_at(&s.id, t0 + Duration::days(1)),
            Touch::Refreshed(_)
        ));
        assert!(registry.drain_expired(t0 + Duration::days(3650)).is_empty());
        assert_eq!(registry.count_active("ABC"), 2);
    }

    #[test]
    fn close_all_empties_everything() {
        let registry = SessionRegistry::new();
        registry.try_open("A", 2, timeout());
        registry.try_open("A", 2, timeout());
        registry.try_open("B", 1, timeout());
        assert_eq!(registry.close_all(), 3);
        assert_eq!(registry.total_active(), 0);
        assert!(registry.index.is_empty());
    }

    #[test]
    fn concurrent_opens_never_over_grant() {
        const CAP: u32 = 5;
        const CALLERS: usize = 32;

        let registry = Arc::new(SessionRegistry::new());
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.try_open("ABC", CAP, Duration::seconds(60))
                })
            })
            .collect();

        let granted: Vec<Session> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(granted.len(), CAP as usize);
        let ids: HashSet<_> = granted.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids.len(), CAP as usize);
        assert_eq!(registry.count_active("ABC"), CAP as usize);
    }

    #[test]
    fn concurrent_double_close_terminates_once() {
        let registry = Arc::new(SessionRegistry::new());
        let s = registry.try_open("ABC", 1, timeout()).unwrap();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                let id = s.id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.close(&id).is_some()
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|closed| *closed)
            .count();
        assert_eq!(successes, 1);
    }
}
