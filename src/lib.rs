//! Leadline - lead filtering, counting and bulk mutation core
//!
//! Backs a multi-tenant lead dashboard: callers edit filters, see live
//! counts and option lists, page through matching leads and run bulk
//! assign/delete jobs with progress reporting.
//!
//! ## Architecture
//!
//! ```text
//! FilterStore (draft → debounced commit)
//!     │
//!     ├─► CountService   ─┐
//!     ├─► UniqueService  ─┤  cached per criteria + caller scope
//!     ├─► QueryService   ─┘
//!     │
//!     └─► BulkService / ImportRunner ─► ProgressHub ─► JobProgressReporter
//!                 │
//!                 └─► CacheRegistry::invalidate_all (once per operation)
//! ```
//!
//! Every read and every bulk resolution goes through `LeadStore` with the
//! caller's `RowScope`: admins see all rows, everyone else only rows
//! assigned to them.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.leadline/
//! ├── leadline.db          # SQLite (leads, users, buckets, import_jobs)
//! ├── lead-filters.json    # Persisted filter state
//! └── config.toml          # Configuration
//! ```

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod filters;
pub mod import_runner;
pub mod job_state;
pub mod lead_store;
pub mod progress_hub;
pub mod progress_reporter;
pub mod services;

// Re-exports
pub use auth::{AuthProvider, StaticAuthProvider, UserTableAuthProvider};
pub use config::Config;
pub use db::leads::LeadCursor;
pub use db::models::{Lead, NewLeadInput};
pub use db::scope::{CallerIdentity, RowScope, UserRole};
pub use db::LeadDb;
pub use error::{LeadError, LeadResult};
pub use filters::{CommittedFilters, DraftFilters, FilterCriteria, FilterField, FilterStore};
pub use import_runner::{ImportRequest, ImportRunner};
pub use job_state::{BulkJobState, JobKind, JobStatus, JobTracker};
pub use lead_store::{JobStore, LeadStore, RetryPolicy, SqliteLeadStore};
pub use progress_hub::{ProgressHub, ProgressHubConfig, ProgressMessage};
pub use progress_reporter::{JobProgressReporter, JobSubscription};
pub use services::Services;
