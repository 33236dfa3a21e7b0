//! Lead query engine
//!
//! Paginated lead rows for committed criteria, either by page number with an
//! exact total or by keyset cursor for infinite scrolling. Both modes use the
//! same ordering (`created_at` desc, `id` desc) so they walk identical rows.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cache::{CacheRegistry, QueryCache};
use super::with_timeout;
use crate::auth::AuthProvider;
use crate::db::leads::LeadCursor;
use crate::db::models::Lead;
use crate::error::{LeadError, LeadResult};
use crate::filters::{FilterCriteria, Pagination};
use crate::lead_store::LeadStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSpec {
    /// 0-based page number, as kept by `FilterStore` pagination
    Offset { page: u32, page_size: u32 },
    /// Rows strictly after `after`; `None` starts at the newest row
    Cursor { after: Option<LeadCursor>, page_size: u32 },
}

impl PageSpec {
    pub fn page_size(&self) -> u32 {
        match self {
            PageSpec::Offset { page_size, .. } | PageSpec::Cursor { page_size, .. } => *page_size,
        }
    }

    fn clamped(&self, max_page_size: u32) -> PageSpec {
        let size = self.page_size().clamp(1, max_page_size.max(1));
        match self {
            PageSpec::Offset { page, .. } => PageSpec::Offset {
                page: *page,
                page_size: size,
            },
            PageSpec::Cursor { after, .. } => PageSpec::Cursor {
                after: after.clone(),
                page_size: size,
            },
        }
    }

    fn cache_tag(&self) -> String {
        match self {
            PageSpec::Offset { page, page_size } => format!("offset:{}:{}", page, page_size),
            PageSpec::Cursor { after: None, page_size } => format!("cursor::{}", page_size),
            PageSpec::Cursor {
                after: Some(cursor),
                page_size,
            } => format!("cursor:{}/{}:{}", cursor.created_at, cursor.id, page_size),
        }
    }
}

impl From<Pagination> for PageSpec {
    fn from(pagination: Pagination) -> Self {
        PageSpec::Offset {
            page: pagination.page,
            page_size: pagination.page_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadPage {
    pub rows: Vec<Lead>,
    /// Exact match count; only computed in offset mode
    pub total: Option<u64>,
    pub has_more: bool,
    /// Position to continue from in cursor mode
    pub next_cursor: Option<LeadCursor>,
}

pub struct QueryService {
    store: Arc<dyn LeadStore>,
    auth: Arc<dyn AuthProvider>,
    cache: Arc<QueryCache<LeadPage>>,
    timeout: Duration,
    max_page_size: u32,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn LeadStore>,
        auth: Arc<dyn AuthProvider>,
        caches: &CacheRegistry,
        ttl: Duration,
        timeout: Duration,
        max_page_size: u32,
    ) -> Self {
        let cache = Arc::new(QueryCache::new("lead_pages", ttl));
        caches.register(cache.clone());
        Self {
            store,
            auth,
            cache,
            timeout,
            max_page_size,
        }
    }

    /// One page of leads under the caller's scope.
    ///
    /// Exceeding the query deadline yields `LeadError::QueryTimeout`; nothing
    /// partial is returned.
    pub async fn query_leads(&self, criteria: &FilterCriteria, spec: PageSpec) -> LeadResult<LeadPage> {
        let caller = self.auth.current_caller().await?;
        let scope = caller.scope();
        let spec = spec.clamped(self.max_page_size);
        let key = criteria.cache_key(&format!("{}|{}", scope.cache_tag(), spec.cache_tag()));

        self.cache
            .get_or_try_compute(&key, || async {
                debug!(caller = %caller, page = %spec.cache_tag(), "Querying leads");
                with_timeout(self.timeout, async {
                    match &spec {
                        PageSpec::Offset { page, page_size } => {
                            let offset = u64::from(*page) * u64::from(*page_size);
                            let (rows, total) = tokio::try_join!(
                                self.store.list_page(criteria, &scope, offset, *page_size),
                                self.store.count(criteria, &scope),
                            )?;
                            let has_more = offset + (rows.len() as u64) < total;
                            Ok::<_, LeadError>(LeadPage {
                                rows,
                                total: Some(total),
                                has_more,
                                next_cursor: None,
                            })
                        }
                        PageSpec::Cursor { after, page_size } => {
                            let rows = self
                                .store
                                .list_after(criteria, &scope, after.as_ref(), *page_size)
                                .await?;
                            let has_more = rows.len() as u64 == u64::from(*page_size);
                            let next_cursor = rows.last().map(LeadCursor::from);
                            Ok(LeadPage {
                                rows,
                                total: None,
                                has_more,
                                next_cursor,
                            })
                        }
                    }
                })
                .await
            })
            .await
    }

    /// Cursor-driven accumulator for infinite scrolling
    pub fn infinite(&self, criteria: FilterCriteria, page_size: u32) -> InfiniteLeadQuery<'_> {
        InfiniteLeadQuery {
            service: self,
            criteria,
            page_size,
            rows: Vec::new(),
            seen: HashSet::new(),
            cursor: None,
            has_next: true,
            pages_fetched: 0,
        }
    }
}

/// Rows accumulated across cursor pages, deduplicated by id
pub struct InfiniteLeadQuery<'a> {
    service: &'a QueryService,
    criteria: FilterCriteria,
    page_size: u32,
    rows: Vec<Lead>,
    seen: HashSet<String>,
    cursor: Option<LeadCursor>,
    has_next: bool,
    pages_fetched: u32,
}

impl InfiniteLeadQuery<'_> {
    pub fn rows(&self) -> &[Lead] {
        &self.rows
    }

    pub fn has_next_page(&self) -> bool {
        self.has_next
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Fetch the next page; returns how many new rows were appended.
    ///
    /// On error the accumulator is left unchanged so the call can be retried.
    pub async fn fetch_next_page(&mut self) -> LeadResult<usize> {
        if !self.has_next {
            return Ok(0);
        }

        let page = self
            .service
            .query_leads(
                &self.criteria,
                PageSpec::Cursor {
                    after: self.cursor.clone(),
                    page_size: self.page_size,
                },
            )
            .await?;

        self.pages_fetched += 1;
        self.has_next = page.has_more && page.next_cursor.is_some();
        if page.next_cursor.is_some() {
            self.cursor = page.next_cursor;
        }

        let before = self.rows.len();
        for row in page.rows {
            if self.seen.insert(row.id.clone()) {
                self.rows.push(row);
            }
        }
        Ok(self.rows.len() - before)
    }

    /// Drain every remaining page
    pub async fn fetch_all(&mut self) -> LeadResult<usize> {
        let mut added = 0;
        while self.has_next {
            added += self.fetch_next_page().await?;
        }
        Ok(added)
    }
}
