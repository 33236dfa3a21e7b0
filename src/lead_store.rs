//! Row store and job store seams
//!
//! Services only talk to `LeadStore` / `JobStore`. `SqliteLeadStore` backs
//! both with the diesel repository functions, running each call on the
//! blocking pool. Reads retry transient failures with doubling backoff;
//! writes are issued exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::db::leads::{self, InsertOutcome, LeadCursor};
use crate::db::models::{Lead, NewLeadInput};
use crate::db::scope::RowScope;
use crate::db::{buckets, jobs, users, LeadDb};
use crate::error::LeadResult;
use crate::filters::{FilterCriteria, FilterField};
use crate::job_state::BulkJobState;

/// Server-side aggregates for one criteria + scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateCounts {
    pub filtered: u64,
    /// Scope-only count
    pub total: u64,
    pub per_field: BTreeMap<FilterField, BTreeMap<String, u64>>,
    pub custom_fields: BTreeMap<String, BTreeMap<String, u64>>,
}

impl AggregateCounts {
    pub fn is_empty(&self) -> bool {
        self.filtered == 0
            && self.total == 0
            && self.per_field.values().all(BTreeMap::is_empty)
            && self.custom_fields.values().all(BTreeMap::is_empty)
    }
}

/// Distinct selectable values under a scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistinctValues {
    pub fields: BTreeMap<FilterField, Vec<String>>,
    pub custom_fields: BTreeMap<String, Vec<String>>,
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn count(&self, criteria: &FilterCriteria, scope: &RowScope) -> LeadResult<u64>;

    async fn aggregate_counts(
        &self,
        criteria: &FilterCriteria,
        scope: &RowScope,
        custom_keys: &[String],
    ) -> LeadResult<AggregateCounts>;

    async fn distinct_values(&self, scope: &RowScope, custom_keys: &[String]) -> LeadResult<DistinctValues>;

    async fn list_page(
        &self,
        criteria: &FilterCriteria,
        scope: &RowScope,
        offset: u64,
        limit: u32,
    ) -> LeadResult<Vec<Lead>>;

    async fn list_after(
        &self,
        criteria: &FilterCriteria,
        scope: &RowScope,
        after: Option<&LeadCursor>,
        limit: u32,
    ) -> LeadResult<Vec<Lead>>;

    /// Newest-first ids matching the criteria, at most `limit`
    async fn resolve_ids(&self, criteria: &FilterCriteria, scope: &RowScope, limit: u32) -> LeadResult<Vec<String>>;

    /// The subset of `ids` still present under `scope`, newest first
    async fn resolve_explicit_ids(&self, ids: &[String], scope: &RowScope) -> LeadResult<Vec<String>>;

    /// One mutation assigning every id; returns rows updated
    async fn assign_ids(&self, ids: &[String], user_id: &str) -> LeadResult<u64>;

    /// One bounded delete batch; returns rows deleted
    async fn delete_ids(&self, ids: &[String]) -> LeadResult<u64>;

    /// Server-side bulk delete for large id lists
    async fn delete_ids_bulk(&self, ids: &[String]) -> LeadResult<u64>;

    async fn custom_field_keys(&self, scope: &RowScope) -> LeadResult<Vec<String>>;

    async fn user_exists(&self, user_id: &str) -> LeadResult<bool>;

    async fn insert_leads(&self, rows: Vec<NewLeadInput>) -> LeadResult<InsertOutcome>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(
        &self,
        state: &BulkJobState,
        bucket_id: Option<&str>,
        created_by: Option<&str>,
    ) -> LeadResult<()>;

    async fn update_job(&self, state: &BulkJobState) -> LeadResult<()>;

    async fn get_job(&self, job_id: &str) -> LeadResult<Option<BulkJobState>>;
}

/// Transport-level retry for reads
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.read_retry_attempts.max(1),
            backoff: config.read_retry_backoff(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

pub struct SqliteLeadStore {
    db: LeadDb,
    retry: RetryPolicy,
}

impl SqliteLeadStore {
    pub fn new(db: LeadDb, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    pub fn shared(db: LeadDb, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self::new(db, retry))
    }

    pub fn db(&self) -> &LeadDb {
        &self.db
    }

    async fn read<F, T>(&self, op: &'static str, f: F) -> LeadResult<T>
    where
        F: Fn(&mut SqliteConnection) -> LeadResult<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let mut delay = self.retry.backoff;
        let mut attempt = 1;
        loop {
            match self.db.run(f.clone()).await {
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    warn!(op, attempt, error = %e, "Transient read failure, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn to_u64_map(map: BTreeMap<String, i64>) -> BTreeMap<String, u64> {
    map.into_iter().map(|(k, v)| (k, v.max(0) as u64)).collect()
}

#[async_trait]
impl LeadStore for SqliteLeadStore {
    async fn count(&self, criteria: &FilterCriteria, scope: &RowScope) -> LeadResult<u64> {
        let (criteria, scope) = (criteria.clone(), scope.clone());
        self.read("count", move |conn| {
            leads::count_leads(conn, &criteria, &scope).map(|n| n.max(0) as u64)
        })
        .await
    }

    async fn aggregate_counts(
        &self,
        criteria: &FilterCriteria,
        scope: &RowScope,
        custom_keys: &[String],
    ) -> LeadResult<AggregateCounts> {
        let (criteria, scope, keys) = (criteria.clone(), scope.clone(), custom_keys.to_vec());
        self.read("aggregate_counts", move |conn| {
            // One read transaction so every aggregate sees the same snapshot
            conn.transaction(|conn| {
                let total = leads::count_leads(conn, &FilterCriteria::default(), &scope)?;
                let filtered = leads::count_leads(conn, &criteria, &scope)?;

                let mut per_field = BTreeMap::new();
                for field in FilterField::ALL {
                    let counts = leads::count_by_field(conn, field, &criteria, &scope)?;
                    per_field.insert(field, to_u64_map(counts));
                }

                let mut custom_fields = BTreeMap::new();
                for key in &keys {
                    let counts = leads::count_by_custom_field(conn, key, &criteria, &scope)?;
                    custom_fields.insert(key.clone(), to_u64_map(counts));
                }

                Ok(AggregateCounts {
                    filtered: filtered.max(0) as u64,
                    total: total.max(0) as u64,
                    per_field,
                    custom_fields,
                })
            })
        })
        .await
    }

    async fn distinct_values(&self, scope: &RowScope, custom_keys: &[String]) -> LeadResult<DistinctValues> {
        let (scope, keys) = (scope.clone(), custom_keys.to_vec());
        self.read("distinct_values", move |conn| {
            conn.transaction(|conn| {
                let mut values = DistinctValues::default();
                for field in FilterField::ALL {
                    values.fields.insert(field, leads::distinct_values(conn, field, &scope)?);
                }
                for key in &keys {
                    values
                        .custom_fields
                        .insert(key.clone(), leads::distinct_custom_values(conn, key, &scope)?);
                }
                Ok(values)
            })
        })
        .await
    }

    async fn list_page(
        &self,
        criteria: &FilterCriteria,
        scope: &RowScope,
        offset: u64,
        limit: u32,
    ) -> LeadResult<Vec<Lead>> {
        let (criteria, scope) = (criteria.clone(), scope.clone());
        self.read("list_page", move |conn| {
            leads::list_page(conn, &criteria, &scope, offset as i64, i64::from(limit))
        })
        .await
    }

    async fn list_after(
        &self,
        criteria: &FilterCriteria,
        scope: &RowScope,
        after: Option<&LeadCursor>,
        limit: u32,
    ) -> LeadResult<Vec<Lead>> {
        let (criteria, scope, after) = (criteria.clone(), scope.clone(), after.cloned());
        self.read("list_after", move |conn| {
            leads::list_after(conn, &criteria, &scope, after.as_ref(), i64::from(limit))
        })
        .await
    }

    async fn resolve_ids(&self, criteria: &FilterCriteria, scope: &RowScope, limit: u32) -> LeadResult<Vec<String>> {
        let (criteria, scope) = (criteria.clone(), scope.clone());
        self.read("resolve_ids", move |conn| {
            leads::resolve_ids(conn, &criteria, &scope, i64::from(limit))
        })
        .await
    }

    async fn resolve_explicit_ids(&self, ids: &[String], scope: &RowScope) -> LeadResult<Vec<String>> {
        let (ids, scope) = (ids.to_vec(), scope.clone());
        self.read("resolve_explicit_ids", move |conn| {
            leads::resolve_explicit_ids(conn, &ids, &scope)
        })
        .await
    }

    async fn assign_ids(&self, ids: &[String], user_id: &str) -> LeadResult<u64> {
        let (ids, user_id) = (ids.to_vec(), user_id.to_string());
        self.db
            .run(move |conn| leads::assign_ids(conn, &ids, &user_id).map(|n| n as u64))
            .await
    }

    async fn delete_ids(&self, ids: &[String]) -> LeadResult<u64> {
        let ids = ids.to_vec();
        self.db
            .run(move |conn| leads::delete_ids(conn, &ids).map(|n| n as u64))
            .await
    }

    async fn delete_ids_bulk(&self, ids: &[String]) -> LeadResult<u64> {
        let ids = ids.to_vec();
        self.db
            .run(move |conn| leads::delete_ids_bulk(conn, &ids).map(|n| n as u64))
            .await
    }

    async fn custom_field_keys(&self, scope: &RowScope) -> LeadResult<Vec<String>> {
        let scope = scope.clone();
        self.read("custom_field_keys", move |conn| {
            let mut keys = buckets::custom_field_keys(conn)?;
            keys.extend(leads::custom_field_keys_in_use(conn, &scope)?);
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
        .await
    }

    async fn user_exists(&self, user_id: &str) -> LeadResult<bool> {
        let user_id = user_id.to_string();
        self.read("user_exists", move |conn| users::user_exists(conn, &user_id))
            .await
    }

    async fn insert_leads(&self, rows: Vec<NewLeadInput>) -> LeadResult<InsertOutcome> {
        self.db.run(move |conn| leads::insert_leads(conn, &rows)).await
    }
}

#[async_trait]
impl JobStore for SqliteLeadStore {
    async fn create_job(
        &self,
        state: &BulkJobState,
        bucket_id: Option<&str>,
        created_by: Option<&str>,
    ) -> LeadResult<()> {
        let state = state.clone();
        let bucket_id = bucket_id.map(String::from);
        let created_by = created_by.map(String::from);
        self.db
            .run(move |conn| jobs::create_job(conn, &state, bucket_id.as_deref(), created_by.as_deref()))
            .await
    }

    async fn update_job(&self, state: &BulkJobState) -> LeadResult<()> {
        let state = state.clone();
        self.db.run(move |conn| jobs::update_job(conn, &state)).await
    }

    async fn get_job(&self, job_id: &str) -> LeadResult<Option<BulkJobState>> {
        let job_id = job_id.to_string();
        self.read("get_job", move |conn| jobs::get_job(conn, &job_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::leads::tests::lead_input;

    fn store() -> SqliteLeadStore {
        SqliteLeadStore::new(LeadDb::open_in_memory().unwrap(), RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_aggregates_are_server_side_and_scoped() {
        let store = store();
        let mut rows: Vec<_> = (0..6).map(|i| lead_input(i, "Springfield", None)).collect();
        rows.extend((6..9).map(|i| lead_input(i, "Ogdenville", None)));
        rows[0].custom_fields.insert("city".into(), serde_json::json!("Capital"));
        store.insert_leads(rows).await.unwrap();

        let keys = store.custom_field_keys(&RowScope::All).await.unwrap();
        assert_eq!(keys, vec!["city".to_string()]);
        // No row is assigned, so a scoped caller sees no in-use keys
        let scoped = RowScope::AssignedTo("rep-1".into());
        assert!(store.custom_field_keys(&scoped).await.unwrap().is_empty());

        let mut criteria = FilterCriteria::default();
        criteria
            .equality_fields
            .insert(FilterField::District, ["Springfield".to_string()].into());
        let counts = store.aggregate_counts(&criteria, &RowScope::All, &keys).await.unwrap();

        assert_eq!(counts.total, 9);
        assert_eq!(counts.filtered, 6);
        assert_eq!(counts.per_field[&FilterField::District].get("Springfield"), Some(&6));
        assert!(counts.per_field[&FilterField::District].get("Ogdenville").is_none());
        assert_eq!(counts.custom_fields["city"].get("Capital"), Some(&1));
    }

    #[tokio::test]
    async fn test_distinct_values_include_custom_keys() {
        let store = store();
        let mut a = lead_input(1, "Springfield", None);
        a.custom_fields.insert("city".into(), serde_json::json!("Capital"));
        let mut b = lead_input(2, "Ogdenville", None);
        b.custom_fields.insert("city".into(), serde_json::json!("Bay"));
        store.insert_leads(vec![a, b]).await.unwrap();

        let values = store.distinct_values(&RowScope::All, &["city".to_string()]).await.unwrap();
        assert_eq!(
            values.fields[&FilterField::District],
            vec!["Ogdenville".to_string(), "Springfield".to_string()]
        );
        assert_eq!(values.custom_fields["city"], vec!["Bay".to_string(), "Capital".to_string()]);
        assert!(values.fields[&FilterField::School].is_empty());
    }
}
