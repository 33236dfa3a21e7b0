//! Count resolver
//!
//! Filtered/total counts plus per-field badges, always computed with
//! server-side aggregation. Keyed by criteria + caller scope, with identical
//! concurrent requests sharing one computation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::cache::{CacheRegistry, QueryCache};
use super::with_timeout;
use crate::auth::AuthProvider;
use crate::error::{LeadError, LeadResult};
use crate::filters::{FilterCriteria, FilterField};
use crate::lead_store::{AggregateCounts, LeadStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadCounts {
    pub filtered_count: u64,
    pub total_count: u64,
    pub has_active_filters: bool,
    pub per_field: BTreeMap<FilterField, BTreeMap<String, u64>>,
    pub custom_fields: BTreeMap<String, BTreeMap<String, u64>>,
    /// Set when the backend failed and these are placeholder zeros
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LeadCounts {
    fn from_aggregates(aggregates: AggregateCounts, has_active_filters: bool) -> Self {
        Self {
            filtered_count: aggregates.filtered,
            total_count: aggregates.total,
            has_active_filters,
            per_field: aggregates.per_field,
            custom_fields: aggregates.custom_fields,
            error: None,
        }
    }

    /// Zero counts labeled with the failure that produced them
    pub fn degraded(criteria: &FilterCriteria, message: impl Into<String>) -> Self {
        Self {
            has_active_filters: criteria.has_active_filters(),
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }

    /// No rows and no badges; treated as a stale-data signal
    pub fn is_empty(&self) -> bool {
        self.filtered_count == 0
            && self.per_field.values().all(BTreeMap::is_empty)
            && self.custom_fields.values().all(BTreeMap::is_empty)
    }
}

pub struct CountService {
    store: Arc<dyn LeadStore>,
    auth: Arc<dyn AuthProvider>,
    cache: Arc<QueryCache<LeadCounts>>,
    timeout: Duration,
}

impl CountService {
    pub fn new(
        store: Arc<dyn LeadStore>,
        auth: Arc<dyn AuthProvider>,
        caches: &CacheRegistry,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        let cache = Arc::new(QueryCache::new("counts", ttl));
        caches.register(cache.clone());
        Self {
            store,
            auth,
            cache,
            timeout,
        }
    }

    /// Counts for committed criteria under the caller's scope.
    ///
    /// Auth failures and timeouts are returned as errors; any other backend
    /// failure becomes a degraded, uncached result.
    pub async fn get_counts(&self, criteria: &FilterCriteria) -> LeadResult<LeadCounts> {
        let caller = self.auth.current_caller().await?;
        let scope = caller.scope();
        let key = criteria.cache_key(&scope.cache_tag());

        let result = self
            .cache
            .get_or_try_compute_retaining(
                &key,
                || async {
                    debug!(key = %key, caller = %caller, "Computing lead counts");
                    let aggregates = with_timeout(self.timeout, async {
                        let custom_keys = self.store.custom_field_keys(&scope).await?;
                        self.store.aggregate_counts(criteria, &scope, &custom_keys).await
                    })
                    .await?;
                    Ok::<_, LeadError>(LeadCounts::from_aggregates(aggregates, criteria.has_active_filters()))
                },
                |counts| !counts.is_empty(),
            )
            .await;

        match result {
            Ok(counts) => Ok(counts),
            Err(e) if e.is_fatal_for_reads() => Err(e),
            Err(e) => {
                warn!(error = %e, "Count query failed, returning degraded counts");
                Ok(LeadCounts::degraded(criteria, e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_counts_are_labeled_zeros() {
        let mut criteria = FilterCriteria::default();
        criteria.search_query = "ada".into();
        let counts = LeadCounts::degraded(&criteria, "Database error: disk I/O");
        assert!(counts.is_degraded());
        assert!(counts.is_empty());
        assert!(counts.has_active_filters);
        assert_eq!(counts.filtered_count, 0);
    }
}
