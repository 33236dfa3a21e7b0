//! Caller identity providers
//!
//! A missing or unknown identity is always `LeadError::Unauthorized`; no
//! resolver downgrades it to an empty result.

use async_trait::async_trait;

use crate::db::scope::{CallerIdentity, UserRole};
use crate::db::{users, LeadDb};
use crate::error::{LeadError, LeadResult};

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_caller(&self) -> LeadResult<CallerIdentity>;
}

/// Fixed identity (or none), for embedding and tests
pub struct StaticAuthProvider {
    caller: Option<CallerIdentity>,
}

impl StaticAuthProvider {
    pub fn new(caller: CallerIdentity) -> Self {
        Self { caller: Some(caller) }
    }

    pub fn anonymous() -> Self {
        Self { caller: None }
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn current_caller(&self) -> LeadResult<CallerIdentity> {
        self.caller
            .clone()
            .ok_or_else(|| LeadError::Unauthorized("no caller identity".to_string()))
    }
}

/// Resolves the role of a known user id from the `users` table
pub struct UserTableAuthProvider {
    db: LeadDb,
    user_id: Option<String>,
}

impl UserTableAuthProvider {
    pub fn new(db: LeadDb, user_id: Option<String>) -> Self {
        Self { db, user_id }
    }
}

#[async_trait]
impl AuthProvider for UserTableAuthProvider {
    async fn current_caller(&self) -> LeadResult<CallerIdentity> {
        let user_id = self
            .user_id
            .clone()
            .ok_or_else(|| LeadError::Unauthorized("no caller identity".to_string()))?;

        let lookup_id = user_id.clone();
        let user = self
            .db
            .run(move |conn| users::get_user(conn, &lookup_id))
            .await?
            .ok_or_else(|| LeadError::Unauthorized(format!("unknown user {}", user_id)))?;

        let role: UserRole = user
            .role
            .parse()
            .map_err(|_| LeadError::Unauthorized(format!("user {} has invalid role {}", user.id, user.role)))?;

        Ok(CallerIdentity::new(user.id, role))
    }
}
