//! Read-through cache in front of the license record store.
//!
//! Every check needs the current revocation/expiry state of a key. Re-reading
//! the store on each request is the freshest option but also the most
//! expensive, so records may be served from memory for at most `ttl`. A
//! revocation therefore becomes visible to new checks within `ttl`; a zero
//! `ttl` disables caching entirely.
//!
//! Every store call, reads and writes alike, is bounded by `store_timeout`. A
//! slow or failing store turns into an error here, which the authority reports
//! as `Unavailable`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::errors::{LicenseError, LicenseResult};
use crate::license::{key_fingerprint, LicenseRecord};
use crate::store::{InstallOutcome, LicenseStore};

#[derive(Debug, Clone)]
struct CachedRecord {
    record: Option<LicenseRecord>,
    fetched_at: Instant,
}

/// TTL-bounded, timeout-guarded view over a [`LicenseStore`].
pub struct LicenseCache {
    store: Arc<dyn LicenseStore>,
    entries: DashMap<String, CachedRecord>,
    ttl: Duration,
    store_timeout: Duration,
}

impl LicenseCache {
    pub fn new(store: Arc<dyn LicenseStore>, ttl: Duration, store_timeout: Duration) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            ttl,
            store_timeout,
        }
    }

    /// Look up a record, from cache when fresh, otherwise from the store.
    ///
    /// Unknown keys are cached too, so a flood of bogus keys does not reach
    /// the store more than once per `ttl`.
    pub async fn get(&self, key: &str) -> LicenseResult<Option<LicenseRecord>> {
        if let Some(hit) = self.fresh_entry(key) {
            return Ok(hit);
        }

        let fetched = self
            .bounded("get_license", key, self.store.get_license(key))
            .await?;

        if let Some(record) = &fetched {
            if record.max_concurrent_sessions == 0 {
                return Err(LicenseError::InvalidRecord(format!(
                    "record {} has max_concurrent_sessions = 0",
                    key_fingerprint(key)
                )));
            }
        }

        if !self.ttl.is_zero() {
            self.entries.insert(
                key.to_string(),
                CachedRecord {
                    record: fetched.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }

        Ok(fetched)
    }

    fn fresh_entry(&self, key: &str) -> Option<Option<LicenseRecord>> {
        if self.ttl.is_zero() {
            return None;
        }
        let entry = self.entries.get(key)?;
        if entry.fetched_at.elapsed() < self.ttl {
            debug!(key = %key_fingerprint(key), "License record served from cache");
            Some(entry.record.clone())
        } else {
            None
        }
    }

    /// Bind an installation fingerprint to `key` in the store.
    pub async fn register_install(
        &self,
        key: &str,
        fingerprint: &str,
        limit: Option<u32>,
    ) -> LicenseResult<InstallOutcome> {
        self.bounded(
            "register_install",
            key,
            self.store.register_install(key, fingerprint, limit),
        )
        .await
    }

    pub async fn install_count(&self, key: &str) -> LicenseResult<u32> {
        self.bounded("install_count", key, self.store.install_count(key))
            .await
    }

    /// Stamp the first activation of `key` and drop its cached record, so the
    /// next lookup sees the activation time.
    pub async fn mark_activated(&self, key: &str, at: DateTime<Utc>) -> LicenseResult<()> {
        let result = self
            .bounded("mark_activated", key, self.store.mark_activated(key, at))
            .await;
        self.invalidate(key);
        result
    }

    /// Ping the store, giving up after `store_timeout`.
    pub async fn ping(&self) -> bool {
        match tokio::time::timeout(self.store_timeout, self.store.ping()).await {
            Ok(reachable) => reachable,
            Err(_) => {
                warn!(
                    backend = self.store.backend_name(),
                    timeout_ms = self.store_timeout.as_millis() as u64,
                    "Record store ping timed out"
                );
                false
            }
        }
    }

    /// Drop a cached entry so the next lookup goes to the store.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn bounded<T, F>(&self, op: &'static str, key: &str, call: F) -> LicenseResult<T>
    where
        F: Future<Output = LicenseResult<T>>,
    {
        let timeout_ms = self.store_timeout.as_millis() as u64;
        tokio::time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| {
                warn!(key = %key_fingerprint(key), op, timeout_ms, "Record store call timed out");
                LicenseError::StoreTimeout(timeout_ms)
            })?
    }

    /// Remove every entry older than the TTL. Returns how many were dropped.
    pub fn purge_stale(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn store(&self) -> &Arc<dyn LicenseStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cache_over(store: Arc<MemoryStore>, ttl: Duration) -> LicenseCache {
        LicenseCache::new(store, ttl, Duration::from_millis(500))
    }

    #[tokio::test]
    async fn serves_stale_within_ttl_then_refreshes() {
        let store = Arc::new(MemoryStore::new());
        store.insert(LicenseRecord::new("ABC", 1));
        let cache = cache_over(Arc::clone(&store), Duration::from_millis(100));

        assert!(cache.get("ABC").await.unwrap().unwrap().active);

        store.set_active("ABC", false);
        // Still within TTL: the cached copy is served.
        assert!(cache.get("ABC").await.unwrap().unwrap().active);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!cache.get("ABC").await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn zero_ttl_always_reads_through() {
        let store = Arc::new(MemoryStore::new());
        store.insert(LicenseRecord::new("ABC", 1));
        let cache = cache_over(Arc::clone(&store), Duration::ZERO);

        assert!(cache.get("ABC").await.unwrap().unwrap().active);
        store.set_active("ABC", false);
        assert!(!cache.get("ABC").await.unwrap().unwrap().active);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn zero_entitlement_is_an_invalid_record() {
        let store = Arc::new(MemoryStore::new());
        store.insert(LicenseRecord::new("ZERO", 0));
        let cache = cache_over(store, Duration::from_secs(5));

        let err = cache.get("ZERO").await.unwrap_err();
        assert!(matches!(err, LicenseError::InvalidRecord(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unknown_keys_are_cached_for_the_ttl() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store), Duration::from_millis(100));

        assert!(cache.get("LATE").await.unwrap().is_none());
        store.insert(LicenseRecord::new("LATE", 1));
        // The negative answer is still fresh.
        assert!(cache.get("LATE").await.unwrap().is_none());
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get("LATE").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn activation_invalidates_the_cached_record() {
        let store = Arc::new(MemoryStore::new());
        store.insert(LicenseRecord::new("ABC", 1));
        let cache = cache_over(Arc::clone(&store), Duration::from_secs(60));

        assert!(cache.get("ABC").await.unwrap().unwrap().activated_at.is_none());
        cache.mark_activated("ABC", Utc::now()).await.unwrap();
        assert!(cache.get("ABC").await.unwrap().unwrap().activated_at.is_some());
    }

    #[tokio::test]
    async fn purge_drops_only_stale_entries() {
        let store = Arc::new(MemoryStore::new());
        store.insert(LicenseRecord::new("A", 1));
        store.insert(LicenseRecord::new("B", 1));
        let cache = cache_over(store, Duration::from_millis(80));

        cache.get("A").await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        cache.get("B").await.unwrap();

        assert_eq!(cache.purge_stale(), 1);
        assert_eq!(cache.len(), 1);
    }
}
