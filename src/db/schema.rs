//! Database schema definitions

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use tracing::info;

use crate::error::LeadError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

#[derive(QueryableByName)]
struct VersionRow {
    #[diesel(sql_type = Integer)]
    version: i32,
}

/// Initialize the database schema
pub fn init_schema(conn: &mut SqliteConnection) -> Result<(), LeadError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &mut SqliteConnection) -> Result<i32, LeadError> {
    conn.batch_execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .map_err(|e| LeadError::from_diesel("Failed to create schema_version table", e))?;

    let row = diesel::sql_query("SELECT version FROM schema_version LIMIT 1")
        .get_result::<VersionRow>(conn)
        .optional()
        .map_err(|e| LeadError::from_diesel("Failed to read schema_version", e))?;

    Ok(row.map(|r| r.version).unwrap_or(0))
}

/// Set schema version
fn set_schema_version(conn: &mut SqliteConnection, version: i32) -> Result<(), LeadError> {
    conn.batch_execute("DELETE FROM schema_version")
        .map_err(|e| LeadError::from_diesel("Failed to clear schema_version", e))?;
    diesel::sql_query("INSERT INTO schema_version (version) VALUES (?)")
        .bind::<Integer, _>(version)
        .execute(conn)
        .map_err(|e| LeadError::from_diesel("Failed to set schema_version", e))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &mut SqliteConnection) -> Result<(), LeadError> {
    conn.batch_execute(LEADS_SCHEMA)
        .map_err(|e| LeadError::from_diesel("Failed to create lead tables", e))?;

    conn.batch_execute(JOBS_SCHEMA)
        .map_err(|e| LeadError::from_diesel("Failed to create job tables", e))?;

    conn.batch_execute(INDEXES_SCHEMA)
        .map_err(|e| LeadError::from_diesel("Failed to create indexes", e))?;

    Ok(())
}

/// Leads, users and buckets
const LEADS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY NOT NULL,
    email TEXT NOT NULL UNIQUE,
    full_name TEXT NOT NULL DEFAULT '',
    role TEXT NOT NULL DEFAULT 'viewer',
    created_at TEXT NOT NULL
);

-- Buckets name the custom field keys applied to rows at import time
CREATE TABLE IF NOT EXISTS buckets (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL UNIQUE,
    field_keys TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

-- Categorical columns use '' for "unset" so equality filters stay two-valued
CREATE TABLE IF NOT EXISTS leads (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    phone TEXT NOT NULL DEFAULT '',
    email TEXT NOT NULL DEFAULT '',
    school TEXT NOT NULL DEFAULT '',
    district TEXT NOT NULL DEFAULT '',
    gender TEXT NOT NULL DEFAULT '',
    stream TEXT NOT NULL DEFAULT '',
    bucket_id TEXT REFERENCES buckets(id) ON DELETE SET NULL,
    custom_fields TEXT NOT NULL DEFAULT '{}',
    assigned_to TEXT REFERENCES users(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Job runner progress records
const JOBS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS import_jobs (
    id TEXT PRIMARY KEY NOT NULL,
    job_type TEXT NOT NULL DEFAULT 'import',
    status TEXT NOT NULL DEFAULT 'pending',
    total INTEGER NOT NULL DEFAULT 0,
    processed INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    errors_json TEXT NOT NULL DEFAULT '[]',
    omitted_errors INTEGER NOT NULL DEFAULT 0,
    message TEXT,
    bucket_id TEXT,
    created_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_leads_created ON leads(created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_leads_assigned ON leads(assigned_to, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_leads_school ON leads(school);
CREATE INDEX IF NOT EXISTS idx_leads_district ON leads(district);
CREATE INDEX IF NOT EXISTS idx_leads_bucket ON leads(bucket_id);
CREATE INDEX IF NOT EXISTS idx_import_jobs_status ON import_jobs(status);
"#;
