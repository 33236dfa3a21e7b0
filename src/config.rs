//! Configuration for leadline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("leadline")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database and persisted filter state
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// SQLite file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Connection pool size for file-backed databases
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Filter debounce window in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Hard deadline for count/list/unique reads
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Count cache lifetime (also the in-flight de-duplication window)
    #[serde(default = "default_count_cache_ttl_ms")]
    pub count_cache_ttl_ms: u64,

    /// Unique value cache lifetime
    #[serde(default = "default_unique_cache_ttl_secs")]
    pub unique_cache_ttl_secs: u64,

    /// List page cache lifetime
    #[serde(default = "default_page_cache_ttl_ms")]
    pub page_cache_ttl_ms: u64,

    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,

    /// Maximum number of ids a bulk operation resolves from a filter
    #[serde(default = "default_bulk_id_ceiling")]
    pub bulk_id_ceiling: u32,

    /// Ids per delete mutation
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,

    /// Explicit id lists longer than this use the server-side bulk delete path
    #[serde(default = "default_server_side_delete_threshold")]
    pub server_side_delete_threshold: usize,

    /// Per-row errors kept in a job report
    #[serde(default = "default_max_reported_errors")]
    pub max_reported_errors: usize,

    /// Fallback poll interval for job progress
    #[serde(default = "default_job_poll_interval_ms")]
    pub job_poll_interval_ms: u64,

    /// Rows per import chunk
    #[serde(default = "default_import_chunk_size")]
    pub import_chunk_size: usize,

    /// Attempts for reads that hit a transient backend error
    #[serde(default = "default_read_retry_attempts")]
    pub read_retry_attempts: u32,

    /// First retry delay; doubles per attempt
    #[serde(default = "default_read_retry_backoff_ms")]
    pub read_retry_backoff_ms: u64,
}

fn default_database_file() -> String {
    "leads.db".to_string()
}

fn default_pool_size() -> u32 {
    4
}

fn default_debounce_ms() -> u64 {
    800
}

fn default_query_timeout_secs() -> u64 {
    15
}

fn default_count_cache_ttl_ms() -> u64 {
    1000
}

fn default_unique_cache_ttl_secs() -> u64 {
    5
}

fn default_page_cache_ttl_ms() -> u64 {
    1000
}

fn default_page_size() -> u32 {
    100
}

fn default_max_page_size() -> u32 {
    1000
}

fn default_bulk_id_ceiling() -> u32 {
    10_000
}

fn default_delete_batch_size() -> usize {
    50
}

fn default_server_side_delete_threshold() -> usize {
    default_delete_batch_size() * 10
}

fn default_max_reported_errors() -> usize {
    100
}

fn default_job_poll_interval_ms() -> u64 {
    2000
}

fn default_import_chunk_size() -> usize {
    50
}

fn default_read_retry_attempts() -> u32 {
    3
}

fn default_read_retry_backoff_ms() -> u64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            pool_size: default_pool_size(),
            debounce_ms: default_debounce_ms(),
            query_timeout_secs: default_query_timeout_secs(),
            count_cache_ttl_ms: default_count_cache_ttl_ms(),
            unique_cache_ttl_secs: default_unique_cache_ttl_secs(),
            page_cache_ttl_ms: default_page_cache_ttl_ms(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            bulk_id_ceiling: default_bulk_id_ceiling(),
            delete_batch_size: default_delete_batch_size(),
            server_side_delete_threshold: default_server_side_delete_threshold(),
            max_reported_errors: default_max_reported_errors(),
            job_poll_interval_ms: default_job_poll_interval_ms(),
            import_chunk_size: default_import_chunk_size(),
            read_retry_attempts: default_read_retry_attempts(),
            read_retry_backoff_ms: default_read_retry_backoff_ms(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn count_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.count_cache_ttl_ms)
    }

    pub fn unique_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.unique_cache_ttl_secs)
    }

    pub fn page_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.page_cache_ttl_ms)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }

    pub fn read_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.read_retry_backoff_ms)
    }
}
