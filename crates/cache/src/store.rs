//! Cache store trait and the in-memory TTL store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use common::{SharedClock, SystemClock};
use tokio::sync::RwLock;

use crate::error::{CacheError, Result};

/// Key-value store holding serialized responses with a time to live.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the live value for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key` for `ttl`, replacing any previous entry.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Removes `key`. Returns whether an entry existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Removes every entry whose key starts with `prefix`. Returns how many
    /// were removed.
    async fn remove_by_prefix(&self, prefix: &str) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// In-memory cache store.
///
/// Entries live in an ordered map so prefix invalidation is a range scan.
/// Expiry is lazy: a read past the deadline removes the entry.
#[derive(Clone)]
pub struct InMemoryCacheStore {
    entries: Arc<RwLock<BTreeMap<String, CacheEntry>>>,
    clock: SharedClock,
    unavailable: Arc<AtomicBool>,
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::with_clock(SystemClock::shared())
    }
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every operation fail with `CacheError::Backend` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored entries, expired ones included until purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drops every expired entry. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            tracing::debug!(purged, "expired cache entries purged");
        }
        purged
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("cache store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let now = self.clock.now();

        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.check_available()?;
        let now = self.clock.now();
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.entries
            .write()
            .await
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<usize> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        let doomed: Vec<String> = entries
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        Ok(doomed.len())
    }
}

impl std::fmt::Debug for InMemoryCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCacheStore")
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ManualClock;

    fn store() -> (InMemoryCacheStore, ManualClock) {
        let clock = ManualClock::starting_now();
        (InMemoryCacheStore::with_clock(clock.shared()), clock)
    }

    #[tokio::test]
    async fn set_then_get() {
        let (store, _) = store();
        store
            .set("tasks|a", "[1]".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("tasks|a").await.unwrap().as_deref(), Some("[1]"));
        assert_eq!(store.get("tasks|b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn entry_expires_lazily() {
        let (store, clock) = store();
        store
            .set("k", "v".into(), Duration::from_secs(30))
            .await
            .unwrap();

        clock.advance(TimeDelta::seconds(29));
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(TimeDelta::seconds(1));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn zero_ttl_is_never_served() {
        let (store, _) = store();
        store.set("k", "v".into(), Duration::ZERO).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let (store, clock) = store();
        store
            .set("short", "1".into(), Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set("long", "2".into(), Duration::from_secs(100))
            .await
            .unwrap();

        clock.advance(TimeDelta::seconds(5));
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remove_by_prefix_scans_range() {
        let (store, _) = store();
        for key in ["tasks|a", "tasks|b", "tasksx|c", "projects|a"] {
            store
                .set(key, "v".into(), Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert_eq!(store.remove_by_prefix("tasks|").await.unwrap(), 2);
        assert!(store.get("tasksx|c").await.unwrap().is_some());
        assert!(store.get("projects|a").await.unwrap().is_some());
        assert_eq!(store.remove_by_prefix("nothing|").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let (store, _) = store();
        store
            .set("k", "v".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.remove("k").await.unwrap());
        assert!(!store.remove("k").await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_fails() {
        let (store, _) = store();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("k").await,
            Err(CacheError::Backend(_))
        ));
        store.set_unavailable(false);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
