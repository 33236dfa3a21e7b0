//! Service layer for leadline
//!
//! Services sit between callers (CLI, embedding UI) and the `LeadStore`.
//! Each service wraps store calls with:
//! - Caller authentication and row scoping
//! - Result caching with in-flight sharing
//! - Query deadlines
//! - Event emission and cache invalidation after mutations
//!
//! ## Architecture
//!
//! ```text
//! FilterStore (committed criteria)
//!     ↓
//! Service Layer (counts, unique values, pages, bulk jobs)
//!     ↓
//! LeadStore / JobStore (lead_store.rs)
//!     ↓
//! SQLite Database (db/*.rs)
//! ```

pub mod bulk_service;
pub mod cache;
pub mod count_service;
pub mod events;
pub mod query_service;
pub mod unique_service;

// Re-exports
pub use bulk_service::{
    equal_distribution, AssignTarget, BulkAssignRequest, BulkAssignResult, BulkDeleteRequest, BulkDeleteResult,
    BulkLimits, BulkService, DistributionMode, Selection,
};
pub use cache::{CacheRegistry, InvalidateCache, QueryCache};
pub use count_service::{CountService, LeadCounts};
pub use events::{spawn_logging_listener, EventBus, EventListener, LeadEvent};
pub use query_service::{InfiniteLeadQuery, LeadPage, PageSpec, QueryService};
pub use unique_service::{UniqueService, UniqueValues};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthProvider;
use crate::config::Config;
use crate::error::{LeadError, LeadResult};
use crate::import_runner::ImportRunner;
use crate::lead_store::{JobStore, LeadStore};
use crate::progress_hub::{ProgressHub, ProgressHubConfig};
use crate::progress_reporter::JobProgressReporter;

/// Run a read under the query deadline
pub(crate) async fn with_timeout<T, F>(limit: Duration, fut: F) -> LeadResult<T>
where
    F: Future<Output = LeadResult<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| LeadError::QueryTimeout(limit))?
}

/// Service container for dependency injection
///
/// Every service shares one store, one auth provider, one event bus and one
/// cache registry, so a mutation anywhere clears every cached read.
pub struct Services {
    pub counts: Arc<CountService>,
    pub unique: Arc<UniqueService>,
    pub query: Arc<QueryService>,
    pub bulk: Arc<BulkService>,
    pub imports: ImportRunner,
    pub progress: Arc<JobProgressReporter>,
    pub hub: Arc<ProgressHub>,
    pub caches: Arc<CacheRegistry>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Wire all services over one store; needs a running runtime
    pub fn new<S>(store: Arc<S>, auth: Arc<dyn AuthProvider>, config: &Config) -> Self
    where
        S: LeadStore + JobStore + 'static,
    {
        let events = Arc::new(EventBus::new());
        let caches = Arc::new(CacheRegistry::new(events.clone()));
        let hub = Arc::new(ProgressHub::new(ProgressHubConfig::default()));
        let leads: Arc<dyn LeadStore> = store.clone();
        let jobs: Arc<dyn JobStore> = store;
        let timeout = config.query_timeout();

        Self {
            counts: Arc::new(CountService::new(
                leads.clone(),
                auth.clone(),
                &caches,
                config.count_cache_ttl(),
                timeout,
            )),
            unique: Arc::new(UniqueService::new(
                leads.clone(),
                auth.clone(),
                &caches,
                config.unique_cache_ttl(),
                timeout,
            )),
            query: Arc::new(QueryService::new(
                leads.clone(),
                auth.clone(),
                &caches,
                config.page_cache_ttl(),
                timeout,
                config.max_page_size,
            )),
            bulk: Arc::new(BulkService::new(
                leads.clone(),
                jobs.clone(),
                auth.clone(),
                caches.clone(),
                events.clone(),
                hub.clone(),
                BulkLimits::from_config(config),
            )),
            imports: ImportRunner::new(
                leads,
                jobs.clone(),
                auth,
                caches.clone(),
                events.clone(),
                hub.clone(),
                config,
            ),
            progress: Arc::new(JobProgressReporter::new(hub.clone(), jobs, config.job_poll_interval())),
            hub,
            caches,
            events,
        }
    }
}
