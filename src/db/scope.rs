//! Caller identity and row scoping
//!
//! `RowScope::condition` is the one predicate every count, unique value,
//! list and bulk resolution query ANDs onto its filters. `permits` is the
//! in-memory mirror used by tests and by explicit-id re-resolution checks.

use std::fmt;
use std::str::FromStr;

use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::Bool;
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};

use super::diesel_schema::leads;
use super::models::Lead;
use crate::error::LeadError;

/// Boxed boolean predicate over the leads table
pub type LeadCondition = Box<dyn BoxableExpression<leads::table, Sqlite, SqlType = Bool>>;

/// Predicate matching every row
pub fn always() -> LeadCondition {
    Box::new(sql::<Bool>("1 = 1"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Manager,
    SalesRep,
    Viewer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Manager => "manager",
            UserRole::SalesRep => "sales_rep",
            UserRole::Viewer => "viewer",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = LeadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "manager" => Ok(UserRole::Manager),
            "sales_rep" => Ok(UserRole::SalesRep),
            "viewer" => Ok(UserRole::Viewer),
            other => Err(LeadError::InvalidInput(format!("unknown role: {}", other))),
        }
    }
}

/// Authenticated caller passed to every resolver
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: String,
    pub role: UserRole,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>, role: UserRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn scope(&self) -> RowScope {
        RowScope::for_caller(self)
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.user_id, self.role)
    }
}

/// Rows visible to a caller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RowScope {
    /// No implicit predicate
    All,
    /// `assigned_to = user_id`
    AssignedTo(String),
}

impl RowScope {
    pub fn for_caller(caller: &CallerIdentity) -> Self {
        if caller.role.is_admin() {
            RowScope::All
        } else {
            RowScope::AssignedTo(caller.user_id.clone())
        }
    }

    /// Diesel predicate for this scope
    pub fn condition(&self) -> LeadCondition {
        match self {
            RowScope::All => always(),
            RowScope::AssignedTo(user_id) => {
                Box::new(leads::assigned_to.assume_not_null().eq(user_id.clone()))
            }
        }
    }

    /// In-memory equivalent of `condition`
    pub fn permits(&self, lead: &Lead) -> bool {
        match self {
            RowScope::All => true,
            RowScope::AssignedTo(user_id) => lead.assigned_to.as_deref() == Some(user_id.as_str()),
        }
    }

    /// Stable tag mixed into cache keys
    pub fn cache_tag(&self) -> String {
        match self {
            RowScope::All => "all".to_string(),
            RowScope::AssignedTo(user_id) => format!("assigned:{}", user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead(assigned_to: Option<&str>) -> Lead {
        Lead {
            id: "l1".into(),
            name: "Ada".into(),
            phone: String::new(),
            email: String::new(),
            school: String::new(),
            district: String::new(),
            gender: String::new(),
            stream: String::new(),
            bucket_id: None,
            custom_fields: "{}".into(),
            assigned_to: assigned_to.map(String::from),
            created_at: "2024-01-01T00:00:00.000000Z".into(),
            updated_at: "2024-01-01T00:00:00.000000Z".into(),
        }
    }

    #[test]
    fn test_admin_sees_everything() {
        let scope = CallerIdentity::new("root", UserRole::Admin).scope();
        assert_eq!(scope, RowScope::All);
        assert!(scope.permits(&lead(None)));
        assert!(scope.permits(&lead(Some("rep-1"))));
    }

    #[test]
    fn test_non_admin_roles_are_scoped_to_assignments() {
        for role in [UserRole::Manager, UserRole::SalesRep, UserRole::Viewer] {
            let scope = CallerIdentity::new("rep-1", role).scope();
            assert_eq!(scope, RowScope::AssignedTo("rep-1".into()));
            assert!(scope.permits(&lead(Some("rep-1"))));
            assert!(!scope.permits(&lead(Some("rep-2"))));
            assert!(!scope.permits(&lead(None)));
        }
    }

    #[test]
    fn test_cache_tags_differ_per_scope() {
        assert_ne!(
            RowScope::AssignedTo("a".into()).cache_tag(),
            RowScope::AssignedTo("b".into()).cache_tag()
        );
        assert_eq!(RowScope::All.cache_tag(), "all");
    }

    #[test]
    fn test_role_round_trips_through_str() {
        for role in [UserRole::Admin, UserRole::Manager, UserRole::SalesRep, UserRole::Viewer] {
            assert_eq!(role.as_str().parse::<UserRole>().unwrap(), role);
        }
        assert!("owner".parse::<UserRole>().is_err());
    }
}
