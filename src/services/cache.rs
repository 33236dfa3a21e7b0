//! Result caches with in-flight sharing
//!
//! Each key owns a slot holding a `OnceCell`. Concurrent callers for the same
//! key await one computation; a slot older than the TTL is replaced on the
//! next lookup. `invalidate_all` drops every slot, so results still in flight
//! land in a slot nobody can reach any more.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::debug;

use super::events::{EventBus, LeadEvent};
use crate::error::LeadResult;

struct Slot<V> {
    cell: OnceCell<(V, Instant)>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self { cell: OnceCell::new() }
    }
}

/// Cache that can be cleared without knowing its value type
pub trait InvalidateCache: Send + Sync {
    fn name(&self) -> &'static str;

    fn invalidate_all(&self);
}

pub struct QueryCache<V> {
    name: &'static str,
    ttl: Duration,
    slots: DashMap<String, Arc<Slot<V>>>,
}

impl<V> QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, key: &str) -> Arc<Slot<V>> {
        let mut entry = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Slot::new()));
        let expired = entry
            .cell
            .get()
            .is_some_and(|(_, computed_at)| computed_at.elapsed() >= self.ttl);
        if expired {
            *entry = Arc::new(Slot::new());
        }
        Arc::clone(&entry)
    }

    /// Cached value for `key`, computing it at most once per TTL window
    pub async fn get_or_try_compute<F, Fut>(&self, key: &str, compute: F) -> LeadResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LeadResult<V>>,
    {
        self.get_or_try_compute_retaining(key, compute, |_| true).await
    }

    /// Like `get_or_try_compute`, but drops the slot when `retain` rejects
    /// the value so the next caller recomputes.
    pub async fn get_or_try_compute_retaining<F, Fut, R>(
        &self,
        key: &str,
        compute: F,
        retain: R,
    ) -> LeadResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LeadResult<V>>,
        R: Fn(&V) -> bool,
    {
        let slot = self.slot(key);
        let (value, _) = slot
            .cell
            .get_or_try_init(|| async { compute().await.map(|v| (v, Instant::now())) })
            .await?;
        let value = value.clone();

        if !retain(&value) {
            self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
            debug!(cache = self.name, key = %key, "Evicted rejected cache entry");
        }
        Ok(value)
    }

    pub fn evict(&self, key: &str) {
        self.slots.remove(key);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<V> InvalidateCache for QueryCache<V>
where
    V: Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn invalidate_all(&self) {
        self.slots.clear();
    }
}

/// Every cache that describes lead data, cleared together after mutations
pub struct CacheRegistry {
    caches: RwLock<Vec<Arc<dyn InvalidateCache>>>,
    events: Arc<EventBus>,
    invalidations: AtomicU64,
}

impl CacheRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            caches: RwLock::new(Vec::new()),
            events,
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn register(&self, cache: Arc<dyn InvalidateCache>) {
        self.caches
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(cache);
    }

    /// Clear every registered cache once and announce it
    pub fn invalidate_all(&self, reason: &str) {
        let caches = self
            .caches
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for cache in caches.iter() {
            cache.invalidate_all();
        }
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        debug!(reason = %reason, caches = caches.len(), "Invalidated lead caches");
        self.events.emit(LeadEvent::CachesInvalidated {
            reason: reason.to_string(),
        });
    }

    /// Number of `invalidate_all` calls so far
    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_concurrent_identical_keys_share_one_computation() {
        let cache: QueryCache<u64> = QueryCache::new("counts", Duration::from_secs(1));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let compute = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(42)
        };
        let (a, b) = tokio::join!(
            cache.get_or_try_compute("k", compute),
            cache.get_or_try_compute("k", compute)
        );

        assert_eq!(a.unwrap(), 42);
        assert_eq!(b.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache: QueryCache<u64> = QueryCache::new("counts", Duration::from_secs(1));
        assert_eq!(cache.get_or_try_compute("k", || async { Ok(1) }).await.unwrap(), 1);
        assert_eq!(cache.get_or_try_compute("k", || async { Ok(2) }).await.unwrap(), 1);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(cache.get_or_try_compute("k", || async { Ok(3) }).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rejected_values_are_not_kept() {
        let cache: QueryCache<u64> = QueryCache::new("counts", Duration::from_secs(60));
        let v = cache
            .get_or_try_compute_retaining("k", || async { Ok(0) }, |v| *v > 0)
            .await
            .unwrap();
        assert_eq!(v, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache: QueryCache<u64> = QueryCache::new("counts", Duration::from_secs(60));
        let err = cache
            .get_or_try_compute("k", || async { Err(crate::error::LeadError::Database("down".into())) })
            .await;
        assert!(err.is_err());
        assert_eq!(cache.get_or_try_compute("k", || async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_registry_clears_every_cache() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let registry = CacheRegistry::new(events);
        let counts: Arc<QueryCache<u64>> = Arc::new(QueryCache::new("counts", Duration::from_secs(60)));
        let pages: Arc<QueryCache<String>> = Arc::new(QueryCache::new("pages", Duration::from_secs(60)));
        registry.register(counts.clone());
        registry.register(pages.clone());

        counts.get_or_try_compute("a", || async { Ok(1) }).await.unwrap();
        pages.get_or_try_compute("b", || async { Ok("p".to_string()) }).await.unwrap();
        registry.invalidate_all("bulk delete");

        assert!(counts.is_empty());
        assert!(pages.is_empty());
        assert_eq!(registry.invalidation_count(), 1);
        assert!(matches!(rx.recv().await.unwrap(), LeadEvent::CachesInvalidated { .. }));
    }
}
