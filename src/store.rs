//! Record store seam.
//!
//! Anything that can answer [`LicenseStore::get_license`] and keep track of a
//! key's installations can back the authority: the SQL [`Database`] when the
//! `server` feature is on, or the in-memory [`MemoryStore`].
//!
//! [`Database`]: crate::server::database::Database

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::errors::LicenseResult;
use crate::license::LicenseRecord;

/// Result of binding an installation fingerprint to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The fingerprint was already bound to the key
    Known,
    /// The fingerprint took a free installation slot
    Registered,
    /// Every installation slot is taken by other fingerprints
    LimitReached,
}

/// Interface to the license record store.
#[async_trait]
pub trait LicenseStore: Send + Sync {
    /// Fetch a license record by key.
    ///
    /// Returns:
    /// - `Ok(Some(record))` if found
    /// - `Ok(None)` if the key is unknown
    /// - `Err(_)` if the store failed to answer
    async fn get_license(&self, key: &str) -> LicenseResult<Option<LicenseRecord>>;

    /// Bind `fingerprint` to `key` unless `limit` other fingerprints already are.
    ///
    /// The count and the insert must be atomic with respect to other calls for
    /// the same key. `None` means no limit.
    async fn register_install(
        &self,
        key: &str,
        fingerprint: &str,
        limit: Option<u32>,
    ) -> LicenseResult<InstallOutcome>;

    /// Number of installations bound to `key`.
    async fn install_count(&self, key: &str) -> LicenseResult<u32>;

    /// Record the first activation of `key`. Later calls leave it unchanged.
    async fn mark_activated(&self, key: &str, at: DateTime<Utc>) -> LicenseResult<()>;

    /// Short backend name for health reporting ("sqlite", "postgres", "memory").
    fn backend_name(&self) -> &'static str;

    /// Whether the store is currently reachable.
    async fn ping(&self) -> bool {
        true
    }
}

/// In-memory record store.
///
/// Used by tests and by the `memory` backend for local runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, LicenseRecord>,
    installs: DashMap<String, HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn insert(&self, record: LicenseRecord) {
        self.records.insert(record.key.clone(), record);
    }

    /// Flip the revocation flag. Returns `false` if the key is unknown.
    pub fn set_active(&self, key: &str, active: bool) -> bool {
        match self.records.get_mut(key) {
            Some(mut record) => {
                record.active = active;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LicenseStore for MemoryStore {
    async fn get_license(&self, key: &str) -> LicenseResult<Option<LicenseRecord>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn register_install(
        &self,
        key: &str,
        fingerprint: &str,
        limit: Option<u32>,
    ) -> LicenseResult<InstallOutcome> {
        // The entry guard serializes every binding for this key.
        let mut bound = self.installs.entry(key.to_string()).or_default();
        if bound.contains(fingerprint) {
            return Ok(InstallOutcome::Known);
        }
        if matches!(limit, Some(limit) if bound.len() >= limit as usize) {
            return Ok(InstallOutcome::LimitReached);
        }
        bound.insert(fingerprint.to_string());
        Ok(InstallOutcome::Registered)
    }

    async fn install_count(&self, key: &str) -> LicenseResult<u32> {
        let count = self.installs.get(key).map_or(0, |bound| bound.len());
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn mark_activated(&self, key: &str, at: DateTime<Utc>) -> LicenseResult<()> {
        if let Some(mut record) = self.records.get_mut(key) {
            record.activated_at.get_or_insert(at);
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get_license("ABC").await.unwrap().is_none());

        store.insert(LicenseRecord::new("ABC", 2));
        let record = store.get_license("ABC").await.unwrap().unwrap();
        assert_eq!(record.max_concurrent_sessions, 2);
        assert!(record.active);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn set_active_on_unknown_key_is_false() {
        let store = MemoryStore::new();
        assert!(!store.set_active("nope", false));

        store.insert(LicenseRecord::new("ABC", 1));
        assert!(store.set_active("ABC", false));
        assert!(!store.get_license("ABC").await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn installs_respect_the_limit() {
        let store = MemoryStore::new();
        store.insert(LicenseRecord::new("ABC", 5).with_install_limit(2));

        assert_eq!(
            store.register_install("ABC", "pc-1", Some(2)).await.unwrap(),
            InstallOutcome::Registered
        );
        assert_eq!(
            store.register_install("ABC", "pc-2", Some(2)).await.unwrap(),
            InstallOutcome::Registered
        );
        assert_eq!(
            store.register_install("ABC", "pc-3", Some(2)).await.unwrap(),
            InstallOutcome::LimitReached
        );
        assert_eq!(
            store.register_install("ABC", "pc-1", Some(2)).await.unwrap(),
            InstallOutcome::Known
        );
        assert_eq!(store.install_count("ABC").await.unwrap(), 2);
        assert_eq!(store.install_count("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn first_activation_sticks() {
        let store = MemoryStore::new();
        store.insert(LicenseRecord::new("ABC", 1));
        let first = Utc::now() - Duration::days(2);

        store.mark_activated("ABC", first).await.unwrap();
        store.mark_activated("ABC", Utc::now()).await.unwrap();
        store.mark_activated("missing", Utc::now()).await.unwrap();

        let record = store.get_license("ABC").await.unwrap().unwrap();
        assert_eq!(record.activated_at, Some(first));
    }
}
