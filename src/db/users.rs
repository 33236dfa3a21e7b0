//! User lookups for authentication and assignment targets

use diesel::prelude::*;

use super::diesel_schema::users;
use super::models::{current_timestamp, NewUser, User};
use super::scope::UserRole;
use crate::error::LeadError;

pub fn create_user(
    conn: &mut SqliteConnection,
    id: &str,
    email: &str,
    full_name: &str,
    role: UserRole,
) -> Result<User, LeadError> {
    let now = current_timestamp();
    let row = NewUser {
        id,
        email,
        full_name,
        role: role.as_str(),
        created_at: &now,
    };

    diesel::insert_into(users::table)
        .values(&row)
        .execute(conn)
        .map_err(|e| LeadError::from_diesel("Failed to create user", e))?;

    get_user(conn, id)?.ok_or_else(|| LeadError::Internal(format!("User {} vanished after insert", id)))
}

pub fn get_user(conn: &mut SqliteConnection, id: &str) -> Result<Option<User>, LeadError> {
    users::table
        .filter(users::id.eq(id))
        .select(User::as_select())
        .first(conn)
        .optional()
        .map_err(|e| LeadError::from_diesel("User lookup failed", e))
}

pub fn user_exists(conn: &mut SqliteConnection, id: &str) -> Result<bool, LeadError> {
    let n: i64 = users::table
        .filter(users::id.eq(id))
        .count()
        .get_result(conn)
        .map_err(|e| LeadError::from_diesel("User lookup failed", e))?;
    Ok(n > 0)
}

pub fn list_users(conn: &mut SqliteConnection) -> Result<Vec<User>, LeadError> {
    users::table
        .order(users::email.asc())
        .select(User::as_select())
        .load(conn)
        .map_err(|e| LeadError::from_diesel("User list failed", e))
}
