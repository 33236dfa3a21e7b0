//! Shared fixtures for integration tests
//!
//! `InstrumentedStore` wraps the SQLite store, counting mutation calls and
//! injecting failures or delays on demand.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use leadline::db::leads::InsertOutcome;
use leadline::db::scope::RowScope;
use leadline::db::users;
use leadline::lead_store::{AggregateCounts, DistinctValues};
use leadline::{
    BulkJobState, CallerIdentity, Config, FilterCriteria, JobStore, Lead, LeadCursor, LeadDb, LeadError,
    LeadResult, LeadStore, NewLeadInput, RetryPolicy, Services, SqliteLeadStore, StaticAuthProvider, UserRole,
};

pub struct InstrumentedStore {
    pub inner: SqliteLeadStore,
    pub aggregate_calls: AtomicUsize,
    pub assign_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub bulk_delete_calls: AtomicUsize,
    fail_aggregates: AtomicBool,
    /// Zero-based `delete_ids` call numbers that fail
    failing_delete_calls: Mutex<HashSet<usize>>,
    list_delay: Mutex<Option<Duration>>,
    key_delay: Mutex<Option<Duration>>,
    /// Rows each `assign_ids` call reports as vanished before the update
    vanishing_assigns: AtomicUsize,
}

impl InstrumentedStore {
    pub fn new(db: LeadDb) -> Self {
        Self {
            inner: SqliteLeadStore::new(db, RetryPolicy::default()),
            aggregate_calls: AtomicUsize::new(0),
            assign_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            bulk_delete_calls: AtomicUsize::new(0),
            fail_aggregates: AtomicBool::new(false),
            failing_delete_calls: Mutex::new(HashSet::new()),
            list_delay: Mutex::new(None),
            key_delay: Mutex::new(None),
            vanishing_assigns: AtomicUsize::new(0),
        }
    }

    pub fn fail_aggregates(&self, fail: bool) {
        self.fail_aggregates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete_call(&self, call: usize) {
        self.failing_delete_calls.lock().unwrap().insert(call);
    }

    pub fn delay_lists(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    pub fn delay_key_discovery(&self, delay: Duration) {
        *self.key_delay.lock().unwrap() = Some(delay);
    }

    /// Delete the last `n` ids of every assignment slice just before it is applied
    pub fn vanish_before_assign(&self, n: usize) {
        self.vanishing_assigns.store(n, Ordering::SeqCst);
    }

    async fn maybe_delay_keys(&self) {
        let delay = *self.key_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn maybe_delay(&self) {
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl LeadStore for InstrumentedStore {
    async fn count(&self, criteria: &FilterCriteria, scope: &RowScope) -> LeadResult<u64> {
        self.maybe_delay().await;
        self.inner.count(criteria, scope).await
    }

    async fn aggregate_counts(
        &self,
        criteria: &FilterCriteria,
        scope: &RowScope,
        custom_keys: &[String],
    ) -> LeadResult<AggregateCounts> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_aggregates.load(Ordering::SeqCst) {
            return Err(LeadError::Database("disk I/O error".into()));
        }
        self.inner.aggregate_counts(criteria, scope, custom_keys).await
    }

    async fn distinct_values(&self, scope: &RowScope, custom_keys: &[String]) -> LeadResult<DistinctValues> {
        self.inner.distinct_values(scope, custom_keys).await
    }

    async fn list_page(
        &self,
        criteria: &FilterCriteria,
        scope: &RowScope,
        offset: u64,
        limit: u32,
    ) -> LeadResult<Vec<Lead>> {
        self.maybe_delay().await;
        self.inner.list_page(criteria, scope, offset, limit).await
    }

    async fn list_after(
        &self,
        criteria: &FilterCriteria,
        scope: &RowScope,
        after: Option<&LeadCursor>,
        limit: u32,
    ) -> LeadResult<Vec<Lead>> {
        self.maybe_delay().await;
        self.inner.list_after(criteria, scope, after, limit).await
    }

    async fn resolve_ids(&self, criteria: &FilterCriteria, scope: &RowScope, limit: u32) -> LeadResult<Vec<String>> {
        self.inner.resolve_ids(criteria, scope, limit).await
    }

    async fn resolve_explicit_ids(&self, ids: &[String], scope: &RowScope) -> LeadResult<Vec<String>> {
        self.inner.resolve_explicit_ids(ids, scope).await
    }

    async fn assign_ids(&self, ids: &[String], user_id: &str) -> LeadResult<u64> {
        self.assign_calls.fetch_add(1, Ordering::SeqCst);
        let vanish = self.vanishing_assigns.load(Ordering::SeqCst).min(ids.len());
        if vanish > 0 {
            self.inner.delete_ids(&ids[ids.len() - vanish..]).await?;
        }
        self.inner.assign_ids(ids, user_id).await
    }

    async fn delete_ids(&self, ids: &[String]) -> LeadResult<u64> {
        let call = self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_delete_calls.lock().unwrap().contains(&call) {
            return Err(LeadError::Database(format!("delete batch {} rejected", call)));
        }
        self.inner.delete_ids(ids).await
    }

    async fn delete_ids_bulk(&self, ids: &[String]) -> LeadResult<u64> {
        self.bulk_delete_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_ids_bulk(ids).await
    }

    async fn custom_field_keys(&self, scope: &RowScope) -> LeadResult<Vec<String>> {
        self.maybe_delay_keys().await;
        self.inner.custom_field_keys(scope).await
    }

    async fn user_exists(&self, user_id: &str) -> LeadResult<bool> {
        self.inner.user_exists(user_id).await
    }

    async fn insert_leads(&self, rows: Vec<NewLeadInput>) -> LeadResult<InsertOutcome> {
        self.inner.insert_leads(rows).await
    }
}

#[async_trait]
impl JobStore for InstrumentedStore {
    async fn create_job(
        &self,
        state: &BulkJobState,
        bucket_id: Option<&str>,
        created_by: Option<&str>,
    ) -> LeadResult<()> {
        self.inner.create_job(state, bucket_id, created_by).await
    }

    async fn update_job(&self, state: &BulkJobState) -> LeadResult<()> {
        self.inner.update_job(state).await
    }

    async fn get_job(&self, job_id: &str) -> LeadResult<Option<BulkJobState>> {
        self.inner.get_job(job_id).await
    }
}

pub fn test_config() -> Config {
    Config {
        job_poll_interval_ms: 20,
        ..Config::default()
    }
}

pub fn admin() -> CallerIdentity {
    CallerIdentity::new("admin-1", UserRole::Admin)
}

pub fn rep(id: &str) -> CallerIdentity {
    CallerIdentity::new(id, UserRole::SalesRep)
}

/// Database with one admin and three sales reps
pub fn database() -> LeadDb {
    let db = LeadDb::open_in_memory().unwrap();
    db.with_conn(|conn| {
        users::create_user(conn, "admin-1", "admin@example.com", "Admin", UserRole::Admin)?;
        for i in 1..=3 {
            users::create_user(
                conn,
                &format!("rep-{}", i),
                &format!("rep{}@example.com", i),
                &format!("Rep {}", i),
                UserRole::SalesRep,
            )?;
        }
        Ok(())
    })
    .unwrap();
    db
}

pub fn services_for(store: &Arc<InstrumentedStore>, caller: Option<CallerIdentity>, config: &Config) -> Services {
    let auth = match caller {
        Some(caller) => StaticAuthProvider::new(caller),
        None => StaticAuthProvider::anonymous(),
    };
    Services::new(store.clone(), Arc::new(auth), config)
}

/// Lead `i`, created `i` minutes before a fixed instant
pub fn lead(i: usize, district: &str, assigned_to: Option<&str>) -> NewLeadInput {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    NewLeadInput {
        id: Some(format!("lead-{:04}", i)),
        name: format!("Lead {}", i),
        phone: format!("555-{:04}", i),
        email: format!("lead{}@example.com", i),
        district: district.to_string(),
        assigned_to: assigned_to.map(String::from),
        created_at: Some(base - chrono::Duration::minutes(i as i64)),
        ..Default::default()
    }
}

pub async fn seed(store: &InstrumentedStore, rows: Vec<NewLeadInput>) {
    let outcome = store.inner.insert_leads(rows).await.unwrap();
    assert!(outcome.errors.is_empty(), "seed rows rejected: {:?}", outcome.errors);
}

pub fn ids(range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("lead-{:04}", i)).collect()
}
