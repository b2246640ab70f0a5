//! Cache-aside wrapper around query handlers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::store::CacheStore;

/// Where and for how long a query's response may be cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub key: String,
    pub ttl: Duration,
}

impl CachePolicy {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
        }
    }
}

/// A query that may opt into caching.
pub trait Cacheable {
    /// `None` bypasses the cache for this request.
    fn cache_policy(&self) -> Option<CachePolicy>;
}

/// A response that can report an unsuccessful outcome.
///
/// Unsuccessful responses are returned to the caller but never cached.
pub trait CacheableResponse {
    fn is_success(&self) -> bool {
        true
    }
}

impl<T> CacheableResponse for Vec<T> {}

impl<T> CacheableResponse for Option<T> {}

/// Get-or-compute wrapper over a [`CacheStore`].
///
/// Cache failures never fail a request: a store error or an unreadable entry
/// degrades to running the handler.
pub struct CacheAside<C: CacheStore + ?Sized> {
    store: Arc<C>,
}

impl<C: CacheStore + ?Sized> Clone for CacheAside<C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<C: CacheStore + ?Sized> CacheAside<C> {
    pub fn new(store: Arc<C>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<C> {
        &self.store
    }

    /// Serves `query` from the cache or runs `handler` and caches its
    /// successful response under the query's policy.
    pub async fn execute<Q, R, E, F, Fut>(&self, query: &Q, handler: F) -> std::result::Result<R, E>
    where
        Q: Cacheable + ?Sized,
        R: Serialize + DeserializeOwned + CacheableResponse,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
    {
        let Some(policy) = query.cache_policy() else {
            return handler().await;
        };

        if let Some(hit) = self.lookup::<R>(&policy.key).await {
            return Ok(hit);
        }

        let response = handler().await?;
        if response.is_success() {
            self.fill(&policy, &response).await;
        } else {
            tracing::debug!(key = %policy.key, "unsuccessful response not cached");
        }
        Ok(response)
    }

    /// Removes one cached response.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let removed = self.store.remove(key).await?;
        tracing::debug!(key, removed, "cache entry invalidated");
        Ok(removed)
    }

    /// Removes every cached response under `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
        let removed = self.store.remove_by_prefix(prefix).await?;
        tracing::debug!(prefix, removed, "cache prefix invalidated");
        Ok(removed)
    }

    async fn lookup<R: DeserializeOwned>(&self, key: &str) -> Option<R> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                metrics::counter!("cache_misses_total").increment(1);
                return None;
            }
            Err(e) => {
                metrics::counter!("cache_errors_total").increment(1);
                tracing::warn!(key, error = %e, "cache read failed");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                metrics::counter!("cache_hits_total").increment(1);
                Some(value)
            }
            Err(e) => {
                metrics::counter!("cache_errors_total").increment(1);
                tracing::warn!(key, error = %e, "discarding unreadable cache entry");
                if let Err(e) = self.store.remove(key).await {
                    tracing::warn!(key, error = %e, "failed to remove unreadable cache entry");
                }
                None
            }
        }
    }

    async fn fill<R: Serialize>(&self, policy: &CachePolicy, response: &R) {
        let raw = match serde_json::to_string(response) {
            Ok(raw) => raw,
            Err(e) => {
                metrics::counter!("cache_errors_total").increment(1);
                tracing::warn!(key = %policy.key, error = %e, "response not serializable");
                return;
            }
        };
        if let Err(e) = self.store.set(&policy.key, raw, policy.ttl).await {
            metrics::counter!("cache_errors_total").increment(1);
            tracing::warn!(key = %policy.key, error = %e, "cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCacheStore;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ByName(&'static str);

    impl Cacheable for ByName {
        fn cache_policy(&self) -> Option<CachePolicy> {
            Some(CachePolicy::new(
                format!("users|name={}", self.0),
                Duration::from_secs(60),
            ))
        }
    }

    struct Uncached;

    impl Cacheable for Uncached {
        fn cache_policy(&self) -> Option<CachePolicy> {
            None
        }
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Lookup {
        success: bool,
        ids: Vec<u32>,
    }

    impl CacheableResponse for Lookup {
        fn is_success(&self) -> bool {
            self.success
        }
    }

    fn cache() -> CacheAside<InMemoryCacheStore> {
        CacheAside::new(Arc::new(InMemoryCacheStore::new()))
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let cache = cache();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let run = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(vec![1, 2, 3])
        };

        assert_eq!(cache.execute(&ByName("ada"), run).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(cache.execute(&ByName("ada"), run).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_policy_bypasses_cache() {
        let cache = cache();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let run = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(Some(7))
        };

        cache.execute(&Uncached, run).await.unwrap();
        cache.execute(&Uncached, run).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.store().is_empty().await);
    }

    #[tokio::test]
    async fn unsuccessful_response_is_not_cached() {
        let cache = cache();
        let failed = cache
            .execute(&ByName("bob"), || async {
                Ok::<_, String>(Lookup {
                    success: false,
                    ids: vec![],
                })
            })
            .await
            .unwrap();
        assert!(!failed.success);
        assert!(cache.store().is_empty().await);
    }

    #[tokio::test]
    async fn handler_error_is_not_cached() {
        let cache = cache();
        let result: std::result::Result<Vec<u32>, String> = cache
            .execute(&ByName("eve"), || async { Err("db down".to_string()) })
            .await;
        assert_eq!(result.unwrap_err(), "db down");
        assert!(cache.store().is_empty().await);
    }
}
