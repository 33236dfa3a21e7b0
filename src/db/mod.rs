//! SQLite database module for lead storage
//!
//! ## Tables
//!
//! - `leads` - Lead rows (categorical columns, custom field JSON, assignment)
//! - `users` - Callers and assignment targets
//! - `buckets` - Named custom field templates
//! - `import_jobs` - Job progress records
//!
//! Repository functions (`leads`, `users`, `buckets`, `jobs`) take a
//! `&mut SqliteConnection` and never retry; retry policy lives in
//! `lead_store`.

pub mod buckets;
pub mod diesel_schema;
pub mod jobs;
pub mod leads;
pub mod models;
pub mod schema;
pub mod scope;
pub mod users;

use std::path::Path;
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use tracing::{debug, info};

use crate::error::LeadError;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection PRAGMAs applied when r2d2 opens a connection
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout: Duration,
    wal: bool,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        let mut pragmas = format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout.as_millis()
        );
        if self.wal {
            pragmas.push_str(" PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
        }
        conn.batch_execute(&pragmas)
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Pooled SQLite database holding leads, users, buckets and jobs
#[derive(Clone)]
pub struct LeadDb {
    pool: DbPool,
}

impl LeadDb {
    /// Open or create the lead database at `db_path`
    pub fn open(db_path: &Path, pool_size: u32) -> Result<Self, LeadError> {
        info!("Opening SQLite database at {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = ConnectionManager::<SqliteConnection>::new(db_path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout: Duration::from_secs(5),
                wal: true,
            }))
            .build(manager)
            .map_err(|e| LeadError::Database(format!("Failed to open SQLite pool: {}", e)))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    ///
    /// Every pooled connection to `:memory:` is a separate database, so the
    /// pool is held at one connection.
    pub fn open_in_memory() -> Result<Self, LeadError> {
        debug!("Opening in-memory SQLite database");

        let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
        let pool = Pool::builder()
            .max_size(1)
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout: Duration::from_secs(5),
                wal: false,
            }))
            .build(manager)
            .map_err(|e| LeadError::Database(format!("Failed to open in-memory SQLite: {}", e)))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), LeadError> {
        let mut conn = self.conn()?;
        schema::init_schema(&mut conn)
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn, LeadError> {
        self.pool
            .get()
            .map_err(|e| LeadError::Transient(format!("Failed to get connection: {}", e)))
    }

    /// Run a closure against a pooled connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LeadError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, LeadError>,
    {
        let mut conn = self.conn()?;
        f(&mut conn)
    }

    /// Run a closure against a pooled connection on the blocking thread pool
    pub async fn run<F, T>(&self, f: F) -> Result<T, LeadError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, LeadError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| LeadError::Internal(format!("Blocking task failed: {}", e)))?
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}
