//! Diesel model definitions for database tables
//!
//! - Queryable structs: for SELECT queries (reading data)
//! - Insertable structs: for INSERT queries (writing data)

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::diesel_schema::*;

// ============================================================================
// Timestamp Helpers (SQLite stores timestamps as TEXT)
// ============================================================================

/// Fixed-width UTC timestamp so that text ordering equals time ordering
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Get current UTC timestamp for SQLite TEXT columns
pub fn current_timestamp() -> String {
    format_timestamp(&Utc::now())
}

// ============================================================================
// Lead Models
// ============================================================================

/// Lead row from SELECT query
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = leads)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Lead {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub school: String,
    pub district: String,
    pub gender: String,
    pub stream: String,
    pub bucket_id: Option<String>,
    pub custom_fields: String,
    pub assigned_to: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Lead {
    /// Parse the schemaless attribute bag; malformed JSON reads as empty
    pub fn custom_fields_value(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_str(&self.custom_fields).unwrap_or_default()
    }
}

/// New lead for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = leads)]
pub struct NewLead<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub phone: &'a str,
    pub email: &'a str,
    pub school: &'a str,
    pub district: &'a str,
    pub gender: &'a str,
    pub stream: &'a str,
    pub bucket_id: Option<&'a str>,
    pub custom_fields: &'a str,
    pub assigned_to: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Lead as supplied by an import or manual insert
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewLeadInput {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub school: String,
    #[serde(default)]
    pub district: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub bucket_id: Option<String>,
    #[serde(default)]
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// Override for backfills; defaults to now
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

// ============================================================================
// User Models
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct User {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub role: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub id: &'a str,
    pub email: &'a str,
    pub full_name: &'a str,
    pub role: &'a str,
    pub created_at: &'a str,
}

// ============================================================================
// Bucket Models
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = buckets)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Bucket {
    pub id: String,
    pub name: String,
    pub field_keys: String,
    pub created_at: String,
}

impl Bucket {
    pub fn field_keys(&self) -> Vec<String> {
        serde_json::from_str(&self.field_keys).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = buckets)]
pub struct NewBucket<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub field_keys: &'a str,
    pub created_at: &'a str,
}

// ============================================================================
// Import Job Models
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = import_jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ImportJobRow {
    pub id: String,
    pub job_type: String,
    pub status: String,
    pub total: i64,
    pub processed: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub errors_json: String,
    pub omitted_errors: i64,
    pub message: Option<String>,
    pub bucket_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = import_jobs)]
pub struct NewImportJob<'a> {
    pub id: &'a str,
    pub job_type: &'a str,
    pub status: &'a str,
    pub total: i64,
    pub bucket_id: Option<&'a str>,
    pub created_by: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Progress columns written on every job update
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = import_jobs)]
pub struct ImportJobChanges<'a> {
    pub status: &'a str,
    pub total: i64,
    pub processed: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub errors_json: &'a str,
    pub omitted_errors: i64,
    pub message: Option<&'a str>,
    pub updated_at: &'a str,
}
