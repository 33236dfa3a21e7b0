//! Unique value resolver
//!
//! Distinct selectable values per filter field and per custom field, scoped
//! to the caller. Cached per (role, user) for a short window.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::cache::{CacheRegistry, QueryCache};
use super::with_timeout;
use crate::auth::AuthProvider;
use crate::db::scope::CallerIdentity;
use crate::error::LeadResult;
use crate::lead_store::{DistinctValues, LeadStore};

pub type UniqueValues = DistinctValues;

pub struct UniqueService {
    store: Arc<dyn LeadStore>,
    auth: Arc<dyn AuthProvider>,
    cache: Arc<QueryCache<UniqueValues>>,
    timeout: Duration,
}

fn cache_key(caller: &CallerIdentity) -> String {
    format!("{}:{}", caller.role, caller.user_id)
}

impl UniqueService {
    pub fn new(
        store: Arc<dyn LeadStore>,
        auth: Arc<dyn AuthProvider>,
        caches: &CacheRegistry,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        let cache = Arc::new(QueryCache::new("unique_values", ttl));
        caches.register(cache.clone());
        Self {
            store,
            auth,
            cache,
            timeout,
        }
    }

    /// Failures propagate; there is no degraded form of option lists.
    pub async fn get_unique_values(&self) -> LeadResult<UniqueValues> {
        let caller = self.auth.current_caller().await?;
        let scope = caller.scope();
        let key = cache_key(&caller);

        self.cache
            .get_or_try_compute(&key, || async {
                debug!(caller = %caller, "Resolving distinct filter values");
                with_timeout(self.timeout, async {
                    let custom_keys = self.store.custom_field_keys(&scope).await?;
                    self.store.distinct_values(&scope, &custom_keys).await
                })
                .await
            })
            .await
    }
}
