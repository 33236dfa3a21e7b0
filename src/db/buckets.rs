//! Bucket templates: named sets of custom field keys

use std::collections::BTreeSet;

use diesel::prelude::*;
use uuid::Uuid;

use super::diesel_schema::buckets;
use super::models::{current_timestamp, Bucket, NewBucket};
use crate::error::LeadError;

pub fn create_bucket(
    conn: &mut SqliteConnection,
    name: &str,
    field_keys: &[String],
) -> Result<Bucket, LeadError> {
    let id = Uuid::new_v4().to_string();
    let keys_json = serde_json::to_string(field_keys)?;
    let now = current_timestamp();

    diesel::insert_into(buckets::table)
        .values(&NewBucket {
            id: &id,
            name,
            field_keys: &keys_json,
            created_at: &now,
        })
        .execute(conn)
        .map_err(|e| LeadError::from_diesel("Failed to create bucket", e))?;

    Ok(Bucket {
        id,
        name: name.to_string(),
        field_keys: keys_json,
        created_at: now,
    })
}

pub fn get_bucket(conn: &mut SqliteConnection, id: &str) -> Result<Option<Bucket>, LeadError> {
    buckets::table
        .filter(buckets::id.eq(id))
        .select(Bucket::as_select())
        .first(conn)
        .optional()
        .map_err(|e| LeadError::from_diesel("Bucket lookup failed", e))
}

pub fn list_buckets(conn: &mut SqliteConnection) -> Result<Vec<Bucket>, LeadError> {
    buckets::table
        .order(buckets::name.asc())
        .select(Bucket::as_select())
        .load(conn)
        .map_err(|e| LeadError::from_diesel("Bucket list failed", e))
}

/// Union of every bucket's field keys, sorted
pub fn custom_field_keys(conn: &mut SqliteConnection) -> Result<Vec<String>, LeadError> {
    let keys: BTreeSet<String> = list_buckets(conn)?
        .iter()
        .flat_map(|bucket| bucket.field_keys())
        .collect();
    Ok(keys.into_iter().collect())
}
