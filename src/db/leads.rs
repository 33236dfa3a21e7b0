//! Lead queries using Diesel with role scoping
//!
//! Every read builds its WHERE clause through `lead_condition`, which ANDs the
//! caller's `RowScope` onto the translated filter criteria. Ordering is always
//! `created_at DESC, id DESC`.

use std::collections::BTreeMap;

use chrono::Utc;
use diesel::dsl::{count_star, sql};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Double, Integer, Nullable, Text};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::diesel_schema::leads;
use super::models::{format_timestamp, Lead, NewLead, NewLeadInput};
use super::scope::{LeadCondition, RowScope};
use crate::error::LeadError;
use crate::filters::{CustomValue, FilterCriteria, FilterField};

/// Ids per `IN (...)` clause when resolving or deleting explicit id lists
pub const ID_CHUNK_SIZE: usize = 500;

/// Keyset position: the last row of the previous page
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadCursor {
    pub created_at: String,
    pub id: String,
}

impl From<&Lead> for LeadCursor {
    fn from(lead: &Lead) -> Self {
        Self {
            created_at: lead.created_at.clone(),
            id: lead.id.clone(),
        }
    }
}

/// Per-row insert failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFailure {
    /// Position of the row in the submitted batch
    pub index: usize,
    pub message: String,
}

/// Result of bulk insert
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub inserted: Vec<String>,
    pub errors: Vec<RowFailure>,
}

// ============================================================================
// Predicate translation
// ============================================================================

/// Escape LIKE wildcards so they match literally (escape char `\`)
pub fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// JSON path addressing one top-level key of `custom_fields`
pub fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('\\', "\\\\").replace('"', "\\\""))
}

fn custom_predicate(key: &str, value: &CustomValue) -> LeadCondition {
    let extracted = sql::<Bool>("json_extract(custom_fields, ")
        .bind::<Text, _>(json_path(key))
        .sql(") = ");
    match value {
        CustomValue::Text(s) => Box::new(extracted.bind::<Text, _>(s.clone())),
        CustomValue::Integer(i) => Box::new(extracted.bind::<BigInt, _>(*i)),
        CustomValue::Float(f) => Box::new(extracted.bind::<Double, _>(*f)),
        // JSON booleans extract as 1/0
        CustomValue::Bool(b) => Box::new(extracted.bind::<Integer, _>(i32::from(*b))),
    }
}

fn field_predicate(field: FilterField, values: Vec<String>) -> LeadCondition {
    match field {
        FilterField::School => Box::new(leads::school.eq_any(values)),
        FilterField::District => Box::new(leads::district.eq_any(values)),
        FilterField::Gender => Box::new(leads::gender.eq_any(values)),
        FilterField::Stream => Box::new(leads::stream.eq_any(values)),
        FilterField::Bucket => Box::new(leads::bucket_id.assume_not_null().eq_any(values)),
    }
}

/// Scope predicate AND the translated criteria
pub fn lead_condition(criteria: &FilterCriteria, scope: &RowScope) -> LeadCondition {
    let mut condition = scope.condition();

    for (field, values) in &criteria.equality_fields {
        if values.is_empty() {
            continue;
        }
        let predicate = field_predicate(*field, values.iter().cloned().collect());
        condition = Box::new(condition.and(predicate));
    }

    if let Some(query) = criteria.search() {
        let pattern = format!("%{}%", escape_like(query));
        let predicate = leads::name
            .like(pattern.clone())
            .escape('\\')
            .or(leads::phone.like(pattern.clone()).escape('\\'))
            .or(leads::email.like(pattern).escape('\\'));
        condition = Box::new(condition.and(predicate));
    }

    if let Some(from) = criteria.date_range.from {
        condition = Box::new(condition.and(leads::created_at.ge(format_timestamp(&from))));
    }
    if let Some(to) = criteria.date_range.to {
        condition = Box::new(condition.and(leads::created_at.le(format_timestamp(&to))));
    }

    for (key, value) in &criteria.custom_filters {
        condition = Box::new(condition.and(custom_predicate(key, value)));
    }

    condition
}

// ============================================================================
// Aggregates
// ============================================================================

/// COUNT(*) of matching rows
pub fn count_leads(
    conn: &mut SqliteConnection,
    criteria: &FilterCriteria,
    scope: &RowScope,
) -> Result<i64, LeadError> {
    leads::table
        .filter(lead_condition(criteria, scope))
        .select(count_star())
        .first::<i64>(conn)
        .map_err(|e| LeadError::from_diesel("Count query failed", e))
}

macro_rules! grouped_counts {
    ($conn:expr, $condition:expr, $column:expr) => {
        leads::table
            .filter($condition)
            .filter($column.ne(""))
            .group_by($column)
            .select(($column, count_star()))
            .load::<(String, i64)>($conn)
    };
}

/// value -> count for one categorical field; unset ('') values are skipped
pub fn count_by_field(
    conn: &mut SqliteConnection,
    field: FilterField,
    criteria: &FilterCriteria,
    scope: &RowScope,
) -> Result<BTreeMap<String, i64>, LeadError> {
    let condition = lead_condition(criteria, scope);
    let rows = match field {
        FilterField::School => grouped_counts!(conn, condition, leads::school),
        FilterField::District => grouped_counts!(conn, condition, leads::district),
        FilterField::Gender => grouped_counts!(conn, condition, leads::gender),
        FilterField::Stream => grouped_counts!(conn, condition, leads::stream),
        FilterField::Bucket => leads::table
            .filter(condition)
            .group_by(leads::bucket_id)
            .select((leads::bucket_id, count_star()))
            .load::<(Option<String>, i64)>(conn)
            .map(|rows| {
                rows.into_iter()
                    .filter_map(|(id, n)| id.map(|id| (id, n)))
                    .collect()
            }),
    }
    .map_err(|e| LeadError::from_diesel("Field count query failed", e))?;

    Ok(rows.into_iter().collect())
}

/// value -> count for one custom field key (values rendered as text)
pub fn count_by_custom_field(
    conn: &mut SqliteConnection,
    key: &str,
    criteria: &FilterCriteria,
    scope: &RowScope,
) -> Result<BTreeMap<String, i64>, LeadError> {
    let path = json_path(key);
    let extracted = || {
        sql::<Nullable<Text>>("CAST(json_extract(custom_fields, ")
            .bind::<Text, _>(path.clone())
            .sql(") AS TEXT)")
    };

    let rows = leads::table
        .filter(lead_condition(criteria, scope))
        .group_by(extracted())
        .select((extracted(), count_star()))
        .load::<(Option<String>, i64)>(conn)
        .map_err(|e| LeadError::from_diesel("Custom field count query failed", e))?;

    Ok(rows
        .into_iter()
        .filter_map(|(value, n)| value.filter(|v| !v.is_empty()).map(|v| (v, n)))
        .collect())
}

macro_rules! distinct_column {
    ($conn:expr, $condition:expr, $column:expr) => {
        leads::table
            .filter($condition)
            .filter($column.ne(""))
            .select($column)
            .distinct()
            .order($column.asc())
            .load::<String>($conn)
    };
}

/// Distinct non-empty values of a categorical field under a scope
pub fn distinct_values(
    conn: &mut SqliteConnection,
    field: FilterField,
    scope: &RowScope,
) -> Result<Vec<String>, LeadError> {
    let condition = scope.condition();
    match field {
        FilterField::School => distinct_column!(conn, condition, leads::school),
        FilterField::District => distinct_column!(conn, condition, leads::district),
        FilterField::Gender => distinct_column!(conn, condition, leads::gender),
        FilterField::Stream => distinct_column!(conn, condition, leads::stream),
        FilterField::Bucket => leads::table
            .filter(condition)
            .filter(leads::bucket_id.is_not_null())
            .select(leads::bucket_id.assume_not_null())
            .distinct()
            .order(leads::bucket_id.asc())
            .load::<String>(conn),
    }
    .map_err(|e| LeadError::from_diesel("Distinct query failed", e))
}

/// Distinct non-empty values of a custom field key under a scope
pub fn distinct_custom_values(
    conn: &mut SqliteConnection,
    key: &str,
    scope: &RowScope,
) -> Result<Vec<String>, LeadError> {
    let rows = leads::table
        .filter(scope.condition())
        .select(
            sql::<Nullable<Text>>("CAST(json_extract(custom_fields, ")
                .bind::<Text, _>(json_path(key))
                .sql(") AS TEXT)"),
        )
        .distinct()
        .load::<Option<String>>(conn)
        .map_err(|e| LeadError::from_diesel("Distinct custom query failed", e))?;

    let mut values: Vec<String> = rows.into_iter().flatten().filter(|v| !v.is_empty()).collect();
    values.sort();
    Ok(values)
}

// ============================================================================
// Row pages
// ============================================================================

/// One offset page, newest first
pub fn list_page(
    conn: &mut SqliteConnection,
    criteria: &FilterCriteria,
    scope: &RowScope,
    offset: i64,
    limit: i64,
) -> Result<Vec<Lead>, LeadError> {
    leads::table
        .filter(lead_condition(criteria, scope))
        .order((leads::created_at.desc(), leads::id.desc()))
        .limit(limit)
        .offset(offset)
        .select(Lead::as_select())
        .load(conn)
        .map_err(|e| LeadError::from_diesel("List query failed", e))
}

/// One keyset page strictly after `after`, newest first
pub fn list_after(
    conn: &mut SqliteConnection,
    criteria: &FilterCriteria,
    scope: &RowScope,
    after: Option<&LeadCursor>,
    limit: i64,
) -> Result<Vec<Lead>, LeadError> {
    let mut query = leads::table
        .select(Lead::as_select())
        .filter(lead_condition(criteria, scope))
        .into_boxed();

    if let Some(cursor) = after {
        query = query.filter(
            leads::created_at.lt(cursor.created_at.clone()).or(leads::created_at
                .eq(cursor.created_at.clone())
                .and(leads::id.lt(cursor.id.clone()))),
        );
    }

    query
        .order((leads::created_at.desc(), leads::id.desc()))
        .limit(limit)
        .load(conn)
        .map_err(|e| LeadError::from_diesel("Cursor query failed", e))
}

/// Ordered ids matching the criteria, at most `limit`
pub fn resolve_ids(
    conn: &mut SqliteConnection,
    criteria: &FilterCriteria,
    scope: &RowScope,
    limit: i64,
) -> Result<Vec<String>, LeadError> {
    leads::table
        .filter(lead_condition(criteria, scope))
        .order((leads::created_at.desc(), leads::id.desc()))
        .limit(limit)
        .select(leads::id)
        .load::<String>(conn)
        .map_err(|e| LeadError::from_diesel("Id resolution failed", e))
}

/// Subset of `ids` that still exists under `scope`, newest first
pub fn resolve_explicit_ids(
    conn: &mut SqliteConnection,
    ids: &[String],
    scope: &RowScope,
) -> Result<Vec<String>, LeadError> {
    let mut found: Vec<(String, String)> = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(ID_CHUNK_SIZE) {
        let rows = leads::table
            .filter(scope.condition())
            .filter(leads::id.eq_any(chunk))
            .select((leads::id, leads::created_at))
            .load::<(String, String)>(conn)
            .map_err(|e| LeadError::from_diesel("Id resolution failed", e))?;
        found.extend(rows);
    }

    found.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    found.dedup_by(|a, b| a.0 == b.0);
    Ok(found.into_iter().map(|(id, _)| id).collect())
}

/// Distinct custom field keys present on rows visible under `scope`
pub fn custom_field_keys_in_use(conn: &mut SqliteConnection, scope: &RowScope) -> Result<Vec<String>, LeadError> {
    #[derive(QueryableByName)]
    struct KeyRow {
        #[diesel(sql_type = Text)]
        key: String,
    }

    const KEYS_SQL: &str = "SELECT DISTINCT j.key AS key FROM leads, json_each(leads.custom_fields) AS j";
    let rows = match scope {
        RowScope::All => diesel::sql_query(format!("{} ORDER BY j.key", KEYS_SQL)).load::<KeyRow>(conn),
        RowScope::AssignedTo(user_id) => {
            diesel::sql_query(format!("{} WHERE leads.assigned_to = ? ORDER BY j.key", KEYS_SQL))
                .bind::<Text, _>(user_id)
                .load::<KeyRow>(conn)
        }
    }
    .map_err(|e| LeadError::from_diesel("Custom key query failed", e))?;

    Ok(rows.into_iter().map(|r| r.key).collect())
}

// ============================================================================
// Mutations
// ============================================================================

/// Assign every id to `user_id`; returns rows updated
pub fn assign_ids(
    conn: &mut SqliteConnection,
    ids: &[String],
    user_id: &str,
) -> Result<usize, LeadError> {
    let now = format_timestamp(&Utc::now());
    diesel::update(leads::table.filter(leads::id.eq_any(ids)))
        .set((leads::assigned_to.eq(Some(user_id)), leads::updated_at.eq(&now)))
        .execute(conn)
        .map_err(|e| LeadError::from_diesel("Assign failed", e))
}

/// Delete one batch of ids; returns rows deleted
pub fn delete_ids(conn: &mut SqliteConnection, ids: &[String]) -> Result<usize, LeadError> {
    diesel::delete(leads::table.filter(leads::id.eq_any(ids)))
        .execute(conn)
        .map_err(|e| LeadError::from_diesel("Delete failed", e))
}

/// Delete a large id list in one transaction
pub fn delete_ids_bulk(conn: &mut SqliteConnection, ids: &[String]) -> Result<usize, LeadError> {
    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let mut deleted = 0;
        for chunk in ids.chunks(ID_CHUNK_SIZE) {
            deleted += diesel::delete(leads::table.filter(leads::id.eq_any(chunk))).execute(conn)?;
        }
        Ok(deleted)
    })
    .map_err(|e| LeadError::from_diesel("Bulk delete failed", e))
}

/// Insert rows in one transaction, recording per-row failures
pub fn insert_leads(
    conn: &mut SqliteConnection,
    inputs: &[NewLeadInput],
) -> Result<InsertOutcome, LeadError> {
    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let mut outcome = InsertOutcome::default();
        let now = format_timestamp(&Utc::now());

        for (index, input) in inputs.iter().enumerate() {
            if input.name.trim().is_empty() {
                outcome.errors.push(RowFailure {
                    index,
                    message: "name is required".to_string(),
                });
                continue;
            }

            let id = input
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let created_at = input
                .created_at
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_else(|| now.clone());
            let custom_fields = serde_json::Value::Object(input.custom_fields.clone()).to_string();

            let row = NewLead {
                id: &id,
                name: input.name.trim(),
                phone: &input.phone,
                email: &input.email,
                school: &input.school,
                district: &input.district,
                gender: &input.gender,
                stream: &input.stream,
                bucket_id: input.bucket_id.as_deref(),
                custom_fields: &custom_fields,
                assigned_to: input.assigned_to.as_deref(),
                created_at: &created_at,
                updated_at: &now,
            };

            match diesel::insert_into(leads::table).values(&row).execute(conn) {
                Ok(_) => outcome.inserted.push(id),
                Err(e) => outcome.errors.push(RowFailure {
                    index,
                    message: e.to_string(),
                }),
            }
        }

        Ok(outcome)
    })
    .map_err(|e| LeadError::from_diesel("Insert failed", e))
}

/// Fetch a single lead by id, unscoped
pub fn get_lead(conn: &mut SqliteConnection, id: &str) -> Result<Option<Lead>, LeadError> {
    leads::table
        .filter(leads::id.eq(id))
        .select(Lead::as_select())
        .first(conn)
        .optional()
        .map_err(|e| LeadError::from_diesel("Lead lookup failed", e))
}
