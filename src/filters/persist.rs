//! Durable filter state
//!
//! The store writes one entry under a stable name holding the draft, the
//! committed snapshot and pagination preferences. Callers treat every error
//! here as non-fatal.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::criteria::FilterCriteria;
use crate::error::LeadError;

/// Stable storage name for persisted filter state
pub const STORAGE_KEY: &str = "lead-filters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    100
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 0,
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedFilterState {
    #[serde(default)]
    pub draft: FilterCriteria,
    #[serde(default)]
    pub committed: FilterCriteria,
    #[serde(default)]
    pub pagination: Pagination,
}

pub trait FilterPersistence: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet
    fn load(&self) -> Result<Option<PersistedFilterState>, LeadError>;

    fn save(&self, state: &PersistedFilterState) -> Result<(), LeadError>;
}

/// `<dir>/lead-filters.json`
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(storage_dir: &Path) -> Self {
        Self {
            path: storage_dir.join(format!("{}.json", STORAGE_KEY)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FilterPersistence for JsonFilePersistence {
    fn load(&self) -> Result<Option<PersistedFilterState>, LeadError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, state: &PersistedFilterState) -> Result<(), LeadError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crash never leaves a truncated entry
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::FilterField;

    #[test]
    fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JsonFilePersistence::new(dir.path());
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JsonFilePersistence::new(dir.path());

        let mut state = PersistedFilterState::default();
        state
            .draft
            .equality_fields
            .insert(FilterField::School, ["North High".to_string()].into());
        state.pagination.page_size = 25;
        persistence.save(&state).unwrap();

        assert!(persistence.path().ends_with("lead-filters.json"));
        assert_eq!(persistence.load().unwrap(), Some(state));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JsonFilePersistence::new(dir.path());
        std::fs::write(persistence.path(), "{not json").unwrap();
        assert!(persistence.load().is_err());
    }
}
