//! Filter criteria value objects
//!
//! `FilterCriteria` is the snapshot every resolver consumes. Two criteria are
//! equal iff their canonical JSON is equal, and the canonical JSON (plus the
//! caller scope) is the cache key for counts, pages and in-flight requests.
//!
//! `DraftFilters` reflects every keystroke; `CommittedFilters` only changes
//! through a debounced commit (or an explicit snapshot for non-interactive
//! callers).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LeadError;

/// Categorical lead columns that support equality filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    School,
    District,
    Gender,
    Stream,
    Bucket,
}

impl FilterField {
    pub const ALL: [FilterField; 5] = [
        FilterField::School,
        FilterField::District,
        FilterField::Gender,
        FilterField::Stream,
        FilterField::Bucket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterField::School => "school",
            FilterField::District => "district",
            FilterField::Gender => "gender",
            FilterField::Stream => "stream",
            FilterField::Bucket => "bucket",
        }
    }
}

impl fmt::Display for FilterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterField {
    type Err = LeadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FilterField::ALL
            .iter()
            .copied()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| LeadError::InvalidInput(format!("unknown filter field: {}", s)))
    }
}

/// Scalar compared against one key of the custom attribute bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CustomValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl CustomValue {
    /// Parse a CLI-style value: booleans and numbers first, text otherwise
    pub fn parse(raw: &str) -> Self {
        if let Ok(b) = raw.parse::<bool>() {
            CustomValue::Bool(b)
        } else if let Ok(i) = raw.parse::<i64>() {
            CustomValue::Integer(i)
        } else if let Ok(f) = raw.parse::<f64>() {
            CustomValue::Float(f)
        } else {
            CustomValue::Text(raw.to_string())
        }
    }
}

/// Inclusive bounds on lead creation time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterCriteria {
    /// Empty set means "no restriction", never "match nothing"
    #[serde(default)]
    pub equality_fields: BTreeMap<FilterField, BTreeSet<String>>,
    #[serde(default)]
    pub search_query: String,
    #[serde(default)]
    pub date_range: DateRange,
    #[serde(default)]
    pub custom_filters: BTreeMap<String, CustomValue>,
}

impl FilterCriteria {
    /// Values selected for a field (empty when unrestricted)
    pub fn values(&self, field: FilterField) -> impl Iterator<Item = &String> {
        self.equality_fields.get(&field).into_iter().flatten()
    }

    /// Trimmed search query, if any
    pub fn search(&self) -> Option<&str> {
        let trimmed = self.search_query.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }

    pub fn has_active_filters(&self) -> bool {
        self.equality_fields.values().any(|values| !values.is_empty())
            || self.search().is_some()
            || !self.date_range.is_unbounded()
            || !self.custom_filters.is_empty()
    }

    fn normalized(&self) -> FilterCriteria {
        FilterCriteria {
            equality_fields: self
                .equality_fields
                .iter()
                .filter(|(_, values)| !values.is_empty())
                .map(|(field, values)| (*field, values.clone()))
                .collect(),
            search_query: self.search_query.trim().to_string(),
            date_range: self.date_range.clone(),
            custom_filters: self.custom_filters.clone(),
        }
    }

    /// Canonical JSON form; the equality and de-duplication key
    pub fn canonical_json(&self) -> String {
        // BTreeMap/BTreeSet keep keys sorted, so serialization is stable
        serde_json::to_string(&self.normalized()).unwrap_or_default()
    }

    /// Cache key for this criteria under a caller scope tag
    pub fn cache_key(&self, scope_tag: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        hasher.update(b"|");
        hasher.update(scope_tag.as_bytes());
        let hash = hasher.finalize();
        hex::encode(&hash[..16])
    }
}

impl PartialEq for FilterCriteria {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_json() == other.canonical_json()
    }
}

// ============================================================================
// Draft / Committed
// ============================================================================

/// Uncommitted filter state, mutated synchronously by setters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftFilters {
    criteria: FilterCriteria,
}

impl DraftFilters {
    pub fn from_criteria(criteria: FilterCriteria) -> Self {
        Self { criteria }
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    pub fn set_field_values<I, S>(&mut self, field: FilterField, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            self.criteria.equality_fields.remove(&field);
        } else {
            self.criteria.equality_fields.insert(field, values);
        }
    }

    /// Toggle one option; returns whether it is selected afterwards
    pub fn toggle_value(&mut self, field: FilterField, value: &str) -> bool {
        let values = self.criteria.equality_fields.entry(field).or_default();
        let selected = if values.remove(value) {
            false
        } else {
            values.insert(value.to_string());
            true
        };
        if values.is_empty() {
            self.criteria.equality_fields.remove(&field);
        }
        selected
    }

    pub fn clear_field(&mut self, field: FilterField) {
        self.criteria.equality_fields.remove(&field);
    }

    pub fn set_search_query(&mut self, query: impl Into<String>) {
        self.criteria.search_query = query.into();
    }

    pub fn set_date_range(&mut self, range: DateRange) {
        self.criteria.date_range = range;
    }

    pub fn set_custom_filter(&mut self, key: impl Into<String>, value: CustomValue) {
        self.criteria.custom_filters.insert(key.into(), value);
    }

    pub fn remove_custom_filter(&mut self, key: &str) {
        self.criteria.custom_filters.remove(key);
    }

    pub fn clear(&mut self) {
        self.criteria = FilterCriteria::default();
    }
}

/// Query-triggering filter snapshot
///
/// Only built by a filter store commit, or by `snapshot` for callers that
/// have no interactive draft (CLI invocations, server requests).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommittedFilters {
    criteria: FilterCriteria,
}

impl CommittedFilters {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Commit criteria that were assembled in one piece
    pub fn snapshot(criteria: FilterCriteria) -> Self {
        Self { criteria }
    }

    pub(crate) fn from_draft(draft: &DraftFilters) -> Self {
        Self {
            criteria: draft.criteria.clone(),
        }
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }
}

impl Deref for CommittedFilters {
    type Target = FilterCriteria;

    fn deref(&self) -> &FilterCriteria {
        &self.criteria
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sets_do_not_change_identity() {
        let mut a = FilterCriteria::default();
        a.equality_fields.insert(FilterField::School, BTreeSet::new());
        a.search_query = "  ".to_string();
        let b = FilterCriteria::default();

        assert_eq!(a, b);
        assert_eq!(a.cache_key("admin"), b.cache_key("admin"));
        assert!(!a.has_active_filters());
    }

    #[test]
    fn test_cache_key_depends_on_scope() {
        let mut criteria = FilterCriteria::default();
        criteria
            .equality_fields
            .insert(FilterField::District, ["Springfield".to_string()].into());

        assert_ne!(criteria.cache_key("admin"), criteria.cache_key("assigned:u1"));
        assert_eq!(criteria.cache_key("admin").len(), 32);
    }

    #[test]
    fn test_canonical_json_is_order_independent() {
        let mut a = DraftFilters::default();
        a.set_field_values(FilterField::School, ["b", "a"]);
        a.set_custom_filter("year", CustomValue::Integer(2024));
        a.set_custom_filter("city", CustomValue::Text("x".into()));

        let mut b = DraftFilters::default();
        b.set_custom_filter("city", CustomValue::Text("x".into()));
        b.set_custom_filter("year", CustomValue::Integer(2024));
        b.set_field_values(FilterField::School, ["a", "b"]);

        assert_eq!(a.criteria().canonical_json(), b.criteria().canonical_json());
    }

    #[test]
    fn test_toggle_value_removes_empty_field() {
        let mut draft = DraftFilters::default();
        assert!(draft.toggle_value(FilterField::Gender, "female"));
        assert!(draft.criteria().has_active_filters());
        assert!(!draft.toggle_value(FilterField::Gender, "female"));
        assert!(!draft.criteria().equality_fields.contains_key(&FilterField::Gender));
    }

    #[test]
    fn test_custom_value_parse() {
        assert_eq!(CustomValue::parse("true"), CustomValue::Bool(true));
        assert_eq!(CustomValue::parse("42"), CustomValue::Integer(42));
        assert_eq!(CustomValue::parse("4.5"), CustomValue::Float(4.5));
        assert_eq!(CustomValue::parse("north"), CustomValue::Text("north".into()));
    }

    #[test]
    fn test_filter_field_from_str() {
        assert_eq!("stream".parse::<FilterField>().unwrap(), FilterField::Stream);
        assert!("colour".parse::<FilterField>().is_err());
    }
}
