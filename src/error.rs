//! Error types for leadline

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeadError {
    /// No caller identity (or an invalid one)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated, but the role may not perform the operation
    #[error("Authorization required: {0}")]
    AuthorizationRequired(String),

    /// A read exceeded the fixed query deadline
    #[error("Query timed out after {}ms; narrow your filters", .0.as_millis())]
    QueryTimeout(Duration),

    /// A bulk operation could not proceed at all
    #[error("Mutation failed: {0}")]
    MutationFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Busy database or exhausted pool; reads may retry these
    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LeadError {
    /// Map a diesel error, classifying lock contention as transient
    pub fn from_diesel(context: &str, err: diesel::result::Error) -> Self {
        let message = err.to_string();
        if is_busy_message(&message) {
            LeadError::Transient(format!("{}: {}", context, message))
        } else {
            LeadError::Database(format!("{}: {}", context, message))
        }
    }

    /// Whether a transport-level retry may be attempted for a read
    pub fn is_transient(&self) -> bool {
        matches!(self, LeadError::Transient(_))
    }

    /// Errors that must reach the caller instead of degrading to an empty result
    pub fn is_fatal_for_reads(&self) -> bool {
        matches!(
            self,
            LeadError::Unauthorized(_)
                | LeadError::AuthorizationRequired(_)
                | LeadError::QueryTimeout(_)
        )
    }
}

impl From<diesel::result::Error> for LeadError {
    fn from(err: diesel::result::Error) -> Self {
        LeadError::from_diesel("Transaction failed", err)
    }
}

fn is_busy_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("database is locked") || lower.contains("database is busy")
}

pub type LeadResult<T> = Result<T, LeadError>;
